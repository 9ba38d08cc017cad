//! Backend invoker capability.

use async_trait::async_trait;
use relay_core::{FailureClass, ModelTarget, TurnContent};
use relay_scheduler::{CredentialRef, classify_failure_text, parse_retry_after_hint};
use relay_session::History;
use serde::Serialize;
use std::time::Duration;

/// Already-decoded request handed to the invoker. Formatting it for a
/// specific provider is the invoker's job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedRequest {
    pub session_id: String,
    /// Full (possibly compacted) history; the last turn is the new one.
    pub history: History,
}

impl PreparedRequest {
    pub fn token_cost(&self) -> u64 {
        self.history.total_cost()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendResponse {
    pub content: TurnContent,
    /// Estimated cost of the reply, stored on the assistant turn.
    pub token_cost: u64,
}

impl BackendResponse {
    pub fn text(text: impl Into<String>, token_cost: u64) -> Self {
        Self {
            content: TurnContent::text(text),
            token_cost,
        }
    }
}

/// Classified failure returned by an invoker.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct BackendFailure {
    pub class: FailureClass,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl BackendFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify a raw provider error message, picking up any retry-after
    /// hint it carries.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify_failure_text(&message),
            retry_after: parse_retry_after_hint(&message),
            message,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Sends a prepared request to one model with one credential.
///
/// Called concurrently from many dispatches. Implementations map every
/// provider error into exactly one [`FailureClass`].
#[async_trait]
pub trait BackendInvoker: Send + Sync {
    async fn invoke(
        &self,
        model: &ModelTarget,
        credential: &CredentialRef,
        request: &PreparedRequest,
    ) -> Result<BackendResponse, BackendFailure>;
}
