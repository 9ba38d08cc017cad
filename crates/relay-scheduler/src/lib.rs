//! Scheduler: credential rotation with cooldowns, fallback-chain decisions,
//! failure classification and retry backoff.

pub mod backoff;
pub mod classify;
pub mod failover;
pub mod rotation;

pub use backoff::Backoff;
pub use classify::{classify_failure_text, parse_retry_after_hint};
pub use failover::{ChainCursor, ExhaustReason, FallbackResolver, NextStep};
pub use rotation::{
    CredentialLease, CredentialProfile, CredentialRef, CredentialRotator, NoneAvailable,
    ProfileView, ReleaseOutcome,
};
