//! Session histories, context compaction and the session store capability.

pub mod compact;
pub mod history;
pub mod store;
pub mod validate;

pub use compact::{
    Compaction, CompactionError, CompactionPolicy, CompactionStrategy, Summarizer, Summary,
    compact,
};
pub use history::History;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use validate::{new_session_id, validate_session_id};
