use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue full: {pending} entries already waiting (limit {limit})")]
    Full { pending: usize, limit: usize },

    #[error("Timed out after {}s waiting for a dispatch slot for session '{session}'", .waited.as_secs())]
    TimedOut { session: String, waited: Duration },

    #[error("Queue entry canceled before dispatch")]
    Canceled,

    #[error("Queue entry dropped before admission")]
    Closed,
}

impl QueueError {
    /// Rejections the caller sees as `queue-rejected`.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Full { .. } | Self::TimedOut { .. } | Self::Closed)
    }
}
