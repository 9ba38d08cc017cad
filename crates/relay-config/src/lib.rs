//! Relay configuration loading and validation (relay.toml).

pub mod config;
pub mod paths;
pub mod validate;

pub use config::{
    CURRENT_SCHEMA_VERSION, CompactionConfig, CompactionStrategyName, CredentialProfileConfig,
    CredentialsConfig, MAX_COOLDOWN_SECONDS, ModelConfig, QueueConfig, RelayConfig, RetryConfig,
};
pub use validate::validate_config;
