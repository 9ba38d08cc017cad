use anyhow::{Context, Result};
use relay_core::{FallbackChain, ModelTarget};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Current schema version for relay.toml
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            credentials: CredentialsConfig::default(),
            model: ModelConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

/// Admission control for the session queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum dispatches in flight across all sessions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum time a submission waits for admission before it is rejected.
    #[serde(default = "default_wait_timeout_seconds")]
    pub wait_timeout_seconds: u64,
    /// Optional cap on entries waiting for admission across all sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<usize>,
}

impl QueueConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            wait_timeout_seconds: default_wait_timeout_seconds(),
            max_pending: None,
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}

fn default_wait_timeout_seconds() -> u64 {
    300
}

/// Retry policy while walking a fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts on the same model (with another credential) before
    /// advancing the chain.
    #[serde(default = "default_per_model_retries")]
    pub per_model_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            per_model_retries: default_per_model_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_per_model_retries() -> u32 {
    1
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

/// Upper bound for any credential cooldown, configured or hinted.
pub const MAX_COOLDOWN_SECONDS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Cooldown applied after an auth or rate-limit failure.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Use the backend's retry-after hint as the cooldown when present.
    #[serde(default = "default_true")]
    pub honor_retry_after: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<CredentialProfileConfig>,
}

impl CredentialsConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            honor_retry_after: true,
            profiles: Vec::new(),
        }
    }
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// One credential profile. Rotation order within a family follows file order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialProfileConfig {
    pub id: String,
    pub family: String,
    /// Opaque reference resolved by the backend invoker (e.g. `env:OPENAI_KEY`).
    #[serde(default)]
    pub secret_ref: String,
}

/// Default fallback chain used when a submission does not bring its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_primary_model")]
    pub primary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<String>,
}

impl ModelConfig {
    pub fn chain(&self) -> Result<FallbackChain> {
        let primary = ModelTarget::parse(&self.primary)
            .with_context(|| format!("invalid model.primary '{}'", self.primary))?;
        let fallbacks = self
            .fallbacks
            .iter()
            .map(|spec| {
                ModelTarget::parse(spec)
                    .with_context(|| format!("invalid model.fallbacks entry '{spec}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FallbackChain::new(primary, fallbacks))
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_model(),
            fallbacks: Vec::new(),
        }
    }
}

fn default_primary_model() -> String {
    "anthropic/claude-opus-4-5".to_string()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionStrategyName {
    #[default]
    KeepRecent,
    KeepImportant,
    SlidingWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default)]
    pub strategy: CompactionStrategyName,
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    /// Leading turns kept by sliding-window.
    #[serde(default = "default_keep_first")]
    pub keep_first: usize,
    /// Trailing turns kept by sliding-window.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
    /// Budget fraction targeted when recompacting after a context overflow.
    #[serde(default = "default_overflow_budget_ratio")]
    pub overflow_budget_ratio: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: CompactionStrategyName::default(),
            token_budget: default_token_budget(),
            keep_first: default_keep_first(),
            keep_last: default_keep_last(),
            overflow_budget_ratio: default_overflow_budget_ratio(),
        }
    }
}

fn default_token_budget() -> u64 {
    100_000
}

fn default_keep_first() -> usize {
    1
}

fn default_keep_last() -> usize {
    20
}

fn default_overflow_budget_ratio() -> f64 {
    0.75
}

impl RelayConfig {
    /// Load from an explicit path. Returns `Ok(None)` when the file is absent.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded relay config");
        Ok(Some(config))
    }

    /// Load from the XDG config location, falling back to defaults.
    pub fn load_default() -> Result<Self> {
        match crate::paths::config_file() {
            Some(path) => Ok(Self::load(&path)?.unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.schema_version > CURRENT_SCHEMA_VERSION {
            tracing::warn!(
                found = config.schema_version,
                supported = CURRENT_SCHEMA_VERSION,
                "relay.toml schema is newer than this build"
            );
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize relay config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
