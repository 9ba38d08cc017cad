//! Admission control for dispatches.
//!
//! Every session owns a FIFO lane. Only the head of a lane is eligible for a
//! global slot; it waits in the global ready FIFO until one frees up. This
//! gives at most one running entry per session and at most `max_concurrent`
//! running entries overall, with no busy polling: waiters park on a oneshot
//! that the queue fires when it hands them a slot.

use chrono::{DateTime, Utc};
use relay_config::QueueConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::QueueError;

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Identifies one queue entry for `status` and `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TicketId(Ulid);

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStage {
    /// Behind an earlier entry of the same session.
    Waiting,
    /// Head of its session, waiting for a global slot.
    Ready,
    /// Holds a slot.
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelOutcome {
    /// Removed before dispatch started.
    Dequeued,
    /// Already running; the dispatch was asked to stop.
    Signaled,
    NotFound,
}

#[derive(Debug)]
struct QueueEntry {
    session: String,
    enqueued_at: DateTime<Utc>,
    stage: EntryStage,
    admit: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<TicketId, QueueEntry>,
    lanes: HashMap<String, VecDeque<TicketId>>,
    ready: VecDeque<TicketId>,
    running: usize,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.entries.len() - self.running
    }

    /// Move the session's new lane head into the global ready FIFO.
    fn promote_lane_head(&mut self, session: &str) {
        if let Some(next) = self.lanes.get(session).and_then(|lane| lane.front()).copied()
            && let Some(entry) = self.entries.get_mut(&next)
            && entry.stage == EntryStage::Waiting
        {
            entry.stage = EntryStage::Ready;
            self.ready.push_back(next);
        }
    }

    fn remove(&mut self, id: TicketId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(lane) = self.lanes.get_mut(&entry.session) {
            lane.retain(|queued| *queued != id);
            if lane.is_empty() {
                self.lanes.remove(&entry.session);
            }
        }
        match entry.stage {
            EntryStage::Running => self.running -= 1,
            EntryStage::Ready => self.ready.retain(|queued| *queued != id),
            EntryStage::Waiting => {}
        }
        if entry.stage != EntryStage::Waiting {
            self.promote_lane_head(&entry.session);
        }
        Some(entry)
    }

    /// Hand free slots to ready entries, oldest first.
    fn pump(&mut self, max_concurrent: usize) {
        while self.running < max_concurrent {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            entry.stage = EntryStage::Running;
            self.running += 1;
            let delivered = entry.admit.take().is_some_and(|tx| tx.send(()).is_ok());
            if delivered {
                let waited = Utc::now() - entry.enqueued_at;
                debug!(
                    session = %entry.session,
                    ticket = %id,
                    waited_ms = waited.num_milliseconds(),
                    running = self.running,
                    "Admitted queue entry"
                );
            } else {
                // Nobody is listening any more; give the slot back.
                self.remove(id);
            }
        }
    }
}

/// Per-session FIFO queue with a global concurrency ceiling. Cloning shares
/// the queue.
#[derive(Debug, Clone)]
pub struct SessionQueue {
    inner: Arc<Mutex<QueueState>>,
    max_concurrent: usize,
    wait_timeout: Duration,
    max_pending: Option<usize>,
}

impl SessionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueState::default())),
            max_concurrent: max_concurrent.max(1),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            max_pending: None,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_concurrent)
            .with_wait_timeout(config.wait_timeout())
            .with_max_pending(config.max_pending)
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue work for `session`. The entry exists as soon as this returns;
    /// await [`QueueTicket::admitted`] to wait for its slot.
    pub fn submit(&self, session: &str) -> Result<QueueTicket, QueueError> {
        let mut state = self.lock();
        if let Some(limit) = self.max_pending {
            let pending = state.pending();
            if pending >= limit {
                warn!(session = %session, pending, limit, "Queue full, rejecting submission");
                return Err(QueueError::Full { pending, limit });
            }
        }

        let id = TicketId(Ulid::new());
        let (admit_tx, admit_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let lane = state.lanes.entry(session.to_string()).or_default();
        lane.push_back(id);
        let stage = if lane.len() == 1 {
            EntryStage::Ready
        } else {
            EntryStage::Waiting
        };
        if stage == EntryStage::Ready {
            state.ready.push_back(id);
        }
        state.entries.insert(
            id,
            QueueEntry {
                session: session.to_string(),
                enqueued_at: Utc::now(),
                stage,
                admit: Some(admit_tx),
                cancel: cancel.clone(),
            },
        );
        debug!(session = %session, ticket = %id, ?stage, "Queued entry");
        state.pump(self.max_concurrent);

        Ok(QueueTicket {
            id,
            session: session.to_string(),
            queue: self.clone(),
            admit: Some(admit_rx),
            cancel,
            settled: false,
        })
    }

    /// Cancel an entry. Queued entries are removed; a running entry only has
    /// its cancellation token fired.
    pub fn cancel(&self, id: TicketId) -> CancelOutcome {
        let mut state = self.lock();
        let Some(entry) = state.entries.get(&id) else {
            return CancelOutcome::NotFound;
        };
        // Fire the token first so a waiter never mistakes the removal for a
        // closed queue.
        entry.cancel.cancel();
        if entry.stage == EntryStage::Running {
            debug!(session = %entry.session, ticket = %id, "Signaled running entry");
            return CancelOutcome::Signaled;
        }
        if let Some(entry) = state.remove(id) {
            debug!(session = %entry.session, ticket = %id, "Dequeued entry");
        }
        state.pump(self.max_concurrent);
        CancelOutcome::Dequeued
    }

    pub fn status(&self, id: TicketId) -> Option<EntryStage> {
        self.lock().entries.get(&id).map(|entry| entry.stage)
    }

    /// Entries owned for `session`: waiting, ready and running.
    pub fn queue_depth(&self, session: &str) -> usize {
        self.lock().lanes.get(session).map_or(0, VecDeque::len)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().running
    }

    /// Entries not yet holding a slot, across all sessions.
    pub fn waiting(&self) -> usize {
        self.lock().pending()
    }

    fn finish(&self, id: TicketId) {
        let mut state = self.lock();
        if state.remove(id).is_some() {
            state.pump(self.max_concurrent);
        }
    }
}

/// A queued entry. Dropping it before admission removes the entry.
#[derive(Debug)]
pub struct QueueTicket {
    id: TicketId,
    session: String,
    queue: SessionQueue,
    admit: Option<oneshot::Receiver<()>>,
    cancel: CancellationToken,
    settled: bool,
}

impl QueueTicket {
    pub fn id(&self) -> TicketId {
        self.id
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Wait for a slot, bounded by the queue's wait timeout.
    pub async fn admitted(mut self) -> Result<SlotGuard, QueueError> {
        let admit = self.admit.take().ok_or(QueueError::Closed)?;
        let waited = self.queue.wait_timeout;
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(QueueError::Canceled),
            result = tokio::time::timeout(waited, admit) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) if self.cancel.is_cancelled() => Err(QueueError::Canceled),
                Ok(Err(_)) => Err(QueueError::Closed),
                Err(_) => Err(QueueError::TimedOut {
                    session: self.session.clone(),
                    waited,
                }),
            },
        };

        match result {
            Ok(()) => {
                self.settled = true;
                Ok(SlotGuard {
                    id: self.id,
                    session: std::mem::take(&mut self.session),
                    queue: self.queue.clone(),
                    cancel: self.cancel.clone(),
                    released: false,
                })
            }
            Err(err) => {
                if let QueueError::TimedOut { .. } = err {
                    warn!(session = %self.session, ticket = %self.id, "Admission wait timed out");
                }
                // Dropping `self` removes the entry.
                Err(err)
            }
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.finish(self.id);
        }
    }
}

/// A held dispatch slot. Releases on drop and admits the session's next
/// entry.
pub struct SlotGuard {
    id: TicketId,
    session: String,
    queue: SessionQueue,
    cancel: CancellationToken,
    released: bool,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("released", &self.released)
            .finish()
    }
}

impl SlotGuard {
    pub fn id(&self) -> TicketId {
        self.id
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Token fired by `SessionQueue::cancel` while this entry runs.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Explicitly release this slot before drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.queue.finish(self.id);
        debug!(session = %self.session, ticket = %self.id, "Released dispatch slot");
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
