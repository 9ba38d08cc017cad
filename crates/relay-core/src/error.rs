use serde::Serialize;

use crate::types::FailureClass;

/// Terminal failure of a dispatch.
///
/// The variants keep "every profile exhausted", "every fallback model
/// exhausted" and "structurally oversized request" apart so callers can act
/// on the difference; the attempt history travels next to it in the report.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DispatchFailure {
    #[error("All {models} model(s) in the fallback chain exhausted (last failure: {last})")]
    Exhausted { models: usize, last: FailureClass },

    #[error("No credential profile available for backend family '{family}'")]
    CredentialsExhausted { family: String },

    #[error("Context overflow: {required} tokens cannot be dropped, budget is {budget}")]
    ContextOverflow { required: u64, budget: u64 },

    #[error("Fatal failure from '{model}': {message}")]
    Fatal { model: String, message: String },

    #[error("Dispatch canceled")]
    Canceled,

    #[error("Queue rejected submission for session '{session}': {reason}")]
    QueueRejected { session: String, reason: String },

    #[error("Session store failed for '{session}': {message}")]
    Store { session: String, message: String },
}

impl DispatchFailure {
    /// Taxonomy label of this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "exhausted",
            Self::CredentialsExhausted { .. } => "credentials-exhausted",
            Self::ContextOverflow { .. } => "context-overflow",
            Self::Fatal { .. } | Self::Store { .. } => "other-fatal",
            Self::Canceled => "canceled",
            Self::QueueRejected { .. } => "queue-rejected",
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
