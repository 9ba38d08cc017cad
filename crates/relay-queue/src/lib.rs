//! Session queue: per-session FIFO lanes feeding a global pool of dispatch
//! slots.

pub mod error;
pub mod queue;

pub use error::QueueError;
pub use queue::{CancelOutcome, EntryStage, QueueTicket, SessionQueue, SlotGuard, TicketId};
