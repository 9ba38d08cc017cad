//! Shared data model for the relay: turns, failure taxonomy, attempt records
//! and model targets.

pub mod error;
pub mod model_spec;
pub mod types;

pub use error::DispatchFailure;
pub use model_spec::{DEFAULT_FAMILY, FallbackChain, ModelTarget};
pub use types::{
    AttemptOutcome, AttemptRecord, FailureClass, Importance, Role, ToolCall, ToolResult, Turn,
    TurnContent, TurnKind,
};
