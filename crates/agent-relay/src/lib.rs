//! Agent-runtime resilience layer.
//!
//! [`Relay`] accepts turns per session, serializes them through the session
//! queue, and dispatches each one across rotated credentials and a model
//! fallback chain, compacting history to the token budget on the way.

pub mod logging;
pub mod relay;

pub use relay::{
    PendingTurn, Relay, TurnHandle, TurnReport, TurnSubmission, TurnSuccess, default_file_store,
};

pub use relay_config::RelayConfig;
pub use relay_core::{
    AttemptOutcome, AttemptRecord, DispatchFailure, FailureClass, FallbackChain, Importance,
    ModelTarget, Turn, TurnContent,
};
pub use relay_executor::{
    BackendFailure, BackendInvoker, BackendResponse, DispatchEvent, DispatchState, PreparedRequest,
};
pub use relay_queue::{CancelOutcome, EntryStage};
pub use relay_scheduler::{CredentialRef, ProfileView};
pub use relay_session::{
    CompactionPolicy, CompactionStrategy, FileSessionStore, History, MemorySessionStore,
    SessionStore, Summarizer, Summary, new_session_id,
};
