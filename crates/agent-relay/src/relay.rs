//! Caller-facing API: submit turns, cancel them, observe the queue.

use anyhow::Result;
use relay_config::{RelayConfig, validate_config};
use relay_core::{
    AttemptRecord, DispatchFailure, FallbackChain, Importance, ModelTarget, Turn, TurnContent,
};
use relay_executor::{BackendInvoker, BackendResponse, DispatchEvent, Dispatcher};
use relay_queue::{CancelOutcome, EntryStage, QueueError, QueueTicket, SessionQueue, TicketId};
use relay_scheduler::{Backoff, CredentialRotator, ProfileView};
use relay_session::{
    CompactionPolicy, FileSessionStore, History, SessionStore, Summarizer, validate_session_id,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One turn to dispatch for a session.
#[derive(Debug, Clone)]
pub struct TurnSubmission {
    pub session_id: String,
    pub content: TurnContent,
    pub importance: Importance,
    /// Precomputed token estimate of `content`.
    pub token_cost: u64,
    /// Falls back to the configured model chain.
    pub chain: Option<FallbackChain>,
    /// Falls back to the configured compaction policy.
    pub compaction: Option<CompactionPolicy>,
}

impl TurnSubmission {
    pub fn new(session_id: impl Into<String>, content: impl Into<TurnContent>, token_cost: u64) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            importance: Importance::Normal,
            token_cost,
            chain: None,
            compaction: None,
        }
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_chain(mut self, chain: FallbackChain) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_compaction(mut self, policy: CompactionPolicy) -> Self {
        self.compaction = Some(policy);
        self
    }
}

/// Identifies a submitted turn for `cancel` and `status`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TurnHandle {
    pub session_id: String,
    pub ticket: TicketId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnSuccess {
    pub response: BackendResponse,
    /// History as persisted: compacted context, the new user turn and the
    /// assistant reply.
    pub history: History,
    pub model: ModelTarget,
    pub credential: String,
}

/// Final result of a submitted turn, with every attempt made for it.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub session_id: String,
    pub outcome: Result<TurnSuccess, DispatchFailure>,
    pub attempts: Vec<AttemptRecord>,
}

impl TurnReport {
    fn failed(session_id: &str, failure: DispatchFailure) -> Self {
        Self {
            session_id: session_id.to_string(),
            outcome: Err(failure),
            attempts: Vec::new(),
        }
    }
}

/// A turn accepted by the queue.
#[derive(Debug)]
pub struct PendingTurn {
    pub handle: TurnHandle,
    task: JoinHandle<TurnReport>,
}

impl PendingTurn {
    /// Wait for the turn to reach a terminal state.
    pub async fn outcome(self) -> TurnReport {
        match self.task.await {
            Ok(report) => report,
            Err(err) => {
                let failure = if err.is_cancelled() {
                    DispatchFailure::Canceled
                } else {
                    DispatchFailure::Fatal {
                        model: String::new(),
                        message: format!("dispatch task failed: {err}"),
                    }
                };
                TurnReport::failed(&self.handle.session_id, failure)
            }
        }
    }
}

/// Resilient front door to the backends. Cloning shares the queue,
/// credentials and store.
#[derive(Clone)]
pub struct Relay {
    config: Arc<RelayConfig>,
    queue: SessionQueue,
    dispatcher: Dispatcher,
    store: Arc<dyn SessionStore>,
    default_chain: FallbackChain,
    default_policy: CompactionPolicy,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("queue", &self.queue)
            .field("dispatcher", &self.dispatcher)
            .field("default_chain", &self.default_chain)
            .field("default_policy", &self.default_policy)
            .finish()
    }
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        invoker: Arc<dyn BackendInvoker>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        validate_config(&config)?;
        let default_chain = config.model.chain()?;
        let default_policy = CompactionPolicy::from_config(&config.compaction);
        let rotator = CredentialRotator::from_config(&config.credentials);
        let dispatcher = Dispatcher::from_config(&config, invoker, rotator);
        let queue = SessionQueue::from_config(&config.queue);
        info!(
            max_concurrent = config.queue.max_concurrent,
            profiles = config.credentials.profiles.len(),
            chain = default_chain.len(),
            strategy = default_policy.strategy.name(),
            "Relay ready"
        );
        Ok(Self {
            config: Arc::new(config),
            queue,
            dispatcher,
            store,
            default_chain,
            default_policy,
        })
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.dispatcher = self.dispatcher.with_summarizer(summarizer);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.dispatcher = self.dispatcher.with_backoff(backoff);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Queue a turn and start its dispatch task.
    ///
    /// Only queue rejections fail synchronously; everything else arrives via
    /// [`PendingTurn::outcome`]. Outside a tokio runtime the turn is rejected.
    pub fn submit_turn(&self, submission: TurnSubmission) -> Result<PendingTurn, DispatchFailure> {
        let session_id = submission.session_id.clone();
        validate_session_id(&session_id).map_err(|err| DispatchFailure::QueueRejected {
            session: session_id.clone(),
            reason: format!("{err:#}"),
        })?;
        let runtime = Handle::try_current().map_err(|err| DispatchFailure::QueueRejected {
            session: session_id.clone(),
            reason: format!("no tokio runtime to run the turn: {err}"),
        })?;

        let ticket = self
            .queue
            .submit(&session_id)
            .map_err(|err| DispatchFailure::QueueRejected {
                session: session_id.clone(),
                reason: err.to_string(),
            })?;
        let handle = TurnHandle {
            session_id: session_id.clone(),
            ticket: ticket.id(),
        };
        debug!(session = %session_id, ticket = %handle.ticket, "Turn submitted");

        let relay = self.clone();
        let task = runtime.spawn(async move { relay.run_turn(ticket, submission).await });
        Ok(PendingTurn { handle, task })
    }

    pub fn cancel(&self, handle: &TurnHandle) -> CancelOutcome {
        let outcome = self.queue.cancel(handle.ticket);
        info!(session = %handle.session_id, ticket = %handle.ticket, ?outcome, "Cancel requested");
        outcome
    }

    pub fn status(&self, handle: &TurnHandle) -> Option<EntryStage> {
        self.queue.status(handle.ticket)
    }

    /// Turns queued or running for `session_id`.
    pub fn queue_depth(&self, session_id: &str) -> usize {
        self.queue.queue_depth(session_id)
    }

    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    /// Progress events of every turn dispatched after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.dispatcher.subscribe()
    }

    pub fn credential_status(&self) -> Vec<ProfileView> {
        self.dispatcher.rotator().snapshot()
    }

    async fn run_turn(&self, ticket: QueueTicket, submission: TurnSubmission) -> TurnReport {
        let session_id = submission.session_id.as_str();
        let guard = match ticket.admitted().await {
            Ok(guard) => guard,
            Err(QueueError::Canceled) => {
                return TurnReport::failed(session_id, DispatchFailure::Canceled);
            }
            Err(err) => {
                warn!(session = %session_id, %err, "Turn rejected by queue");
                return TurnReport::failed(
                    session_id,
                    DispatchFailure::QueueRejected {
                        session: session_id.to_string(),
                        reason: err.to_string(),
                    },
                );
            }
        };

        let mut history = match self.store.load(session_id).await {
            Ok(history) => history,
            Err(err) => return TurnReport::failed(session_id, store_failure(session_id, &err)),
        };
        history.push(
            Turn::user(submission.content, submission.token_cost)
                .with_importance(submission.importance),
        );

        let chain = submission.chain.as_ref().unwrap_or(&self.default_chain);
        let policy = submission.compaction.as_ref().unwrap_or(&self.default_policy);
        let report = self
            .dispatcher
            .dispatch(session_id, history, chain, policy, &guard.cancellation())
            .await;

        let outcome = match report.outcome {
            Ok(success) => {
                let mut history = success.history;
                history.push(Turn::assistant(
                    success.response.content.clone(),
                    success.response.token_cost,
                ));
                match self.store.save(session_id, &history).await {
                    Ok(()) => Ok(TurnSuccess {
                        response: success.response,
                        history,
                        model: success.model,
                        credential: success.credential,
                    }),
                    Err(err) => Err(store_failure(session_id, &err)),
                }
            }
            Err(failure) => Err(failure),
        };
        // The slot is held until the history is saved.
        drop(guard);

        TurnReport {
            session_id: session_id.to_string(),
            outcome,
            attempts: report.attempts,
        }
    }
}

/// File-backed store under the platform state directory
/// (`~/.local/state/agent-relay` on Linux).
pub fn default_file_store() -> Result<FileSessionStore> {
    let root = relay_config::paths::state_dir()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine state directory for session store"))?;
    Ok(FileSessionStore::new(root))
}

fn store_failure(session_id: &str, err: &anyhow::Error) -> DispatchFailure {
    warn!(session = %session_id, error = %format!("{err:#}"), "Session store failed");
    DispatchFailure::Store {
        session: session_id.to_string(),
        message: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_executor::{BackendFailure, PreparedRequest};
    use relay_scheduler::CredentialRef;
    use relay_session::MemorySessionStore;

    struct Echo;

    #[async_trait]
    impl BackendInvoker for Echo {
        async fn invoke(
            &self,
            _model: &ModelTarget,
            _credential: &CredentialRef,
            request: &PreparedRequest,
        ) -> Result<BackendResponse, BackendFailure> {
            let last = request.history.last().map(|t| t.content().text.clone());
            Ok(BackendResponse::text(last.unwrap_or_default(), 1))
        }
    }

    fn config() -> RelayConfig {
        RelayConfig::from_toml(
            r#"
            [[credentials.profiles]]
            id = "a"
            family = "anthropic"
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_turn_persists_history() {
        let store = Arc::new(MemorySessionStore::new());
        let relay = Relay::new(config(), Arc::new(Echo), store.clone()).unwrap();

        let pending = relay.submit_turn(TurnSubmission::new("s1", "hello", 2)).unwrap();
        let report = pending.outcome().await;
        let success = report.outcome.unwrap();
        assert_eq!(success.response.content.text, "hello");
        assert_eq!(report.attempts.len(), 1);

        let saved = store.load("s1").await.unwrap();
        assert_eq!(saved, success.history);
        assert_eq!(saved.len(), 2);
        assert_eq!(relay.queue_depth("s1"), 0);
    }

    #[tokio::test]
    async fn test_invalid_session_id_is_rejected() {
        let relay = Relay::new(config(), Arc::new(Echo), Arc::new(MemorySessionStore::new())).unwrap();
        let err = relay
            .submit_turn(TurnSubmission::new("../x", "hi", 1))
            .unwrap_err();
        assert_eq!(err.kind(), "queue-rejected");
    }

    #[test]
    fn test_submit_outside_runtime_is_rejected() {
        let relay = Relay::new(config(), Arc::new(Echo), Arc::new(MemorySessionStore::new())).unwrap();
        let err = relay
            .submit_turn(TurnSubmission::new("s1", "hi", 1))
            .unwrap_err();
        assert_eq!(err.kind(), "queue-rejected");
        assert_eq!(relay.queue_depth("s1"), 0);
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let mut config = config();
        config.queue.max_concurrent = 0;
        let result = Relay::new(config, Arc::new(Echo), Arc::new(MemorySessionStore::new()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_credential_status_lists_profiles() {
        let relay = Relay::new(config(), Arc::new(Echo), Arc::new(MemorySessionStore::new())).unwrap();
        let status = relay.credential_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].id, "a");
        assert!(status[0].available);
    }
}
