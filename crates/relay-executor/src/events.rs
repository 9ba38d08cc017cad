//! Progress events published while dispatches run.

use relay_core::FailureClass;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::dispatcher::DispatchState;

/// Slow subscribers skip the oldest events beyond this backlog.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One step of a dispatch. Every event names its session; a session has at
/// most one dispatch in flight, so the session id identifies the turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DispatchEvent {
    /// The dispatch entered `state`. Published for every transition,
    /// starting with `Admitted` and ending with a terminal state.
    State {
        session: String,
        state: DispatchState,
    },
    /// A credential was leased and the backend call is starting.
    Attempt {
        session: String,
        attempt: u32,
        model: String,
        credential: String,
    },
    /// Waiting before another attempt on the same model.
    Retry {
        session: String,
        model: String,
        /// Retry number on this model, starting at 1.
        retry: u32,
        max_retries: u32,
        delay_ms: u64,
        failure: FailureClass,
        error: String,
    },
    /// History was pruned before an attempt.
    Compacted {
        session: String,
        dropped: usize,
        tokens_before: u64,
        tokens_after: u64,
    },
    /// The dispatch failed; followed by the terminal `State` event.
    Error {
        session: String,
        kind: &'static str,
        message: String,
    },
}

impl DispatchEvent {
    pub fn session(&self) -> &str {
        match self {
            Self::State { session, .. }
            | Self::Attempt { session, .. }
            | Self::Retry { session, .. }
            | Self::Compacted { session, .. }
            | Self::Error { session, .. } => session,
        }
    }

    /// True for the last event a dispatch publishes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::State { state, .. } if state.is_terminal())
    }
}

/// Fan-out of dispatch events. Publishing never blocks and is a no-op
/// without subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: DispatchEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
