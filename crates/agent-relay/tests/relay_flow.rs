use agent_relay::{
    BackendFailure, BackendInvoker, BackendResponse, CancelOutcome, CredentialRef, DispatchEvent,
    DispatchState, EntryStage, FailureClass, FileSessionStore, MemorySessionStore, ModelTarget,
    PreparedRequest, Relay, RelayConfig, SessionStore, TurnSubmission,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};

/// One recorded backend call: session, model, credential, history length.
type Call = (String, String, String, usize);

/// Invoker that parks every call on a gate and reports when a call starts.
/// Anthropic models answer with a rate limit when `limit_anthropic` is set.
struct GatedInvoker {
    gate: Arc<Semaphore>,
    started: mpsc::UnboundedSender<String>,
    calls: Mutex<Vec<Call>>,
    limit_anthropic: bool,
}

impl GatedInvoker {
    fn new(open: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (started, rx) = mpsc::unbounded_channel();
        let permits = if open { Semaphore::MAX_PERMITS } else { 0 };
        let invoker = Arc::new(Self {
            gate: Arc::new(Semaphore::new(permits)),
            started,
            calls: Mutex::new(Vec::new()),
            limit_anthropic: false,
        });
        (invoker, rx)
    }

    fn rate_limiting_anthropic() -> Arc<Self> {
        let (started, _rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
            started,
            calls: Mutex::new(Vec::new()),
            limit_anthropic: true,
        })
    }

    fn open(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendInvoker for GatedInvoker {
    async fn invoke(
        &self,
        model: &ModelTarget,
        credential: &CredentialRef,
        request: &PreparedRequest,
    ) -> Result<BackendResponse, BackendFailure> {
        self.calls.lock().unwrap().push((
            request.session_id.clone(),
            model.to_string(),
            credential.id.clone(),
            request.history.len(),
        ));
        let _ = self.started.send(request.session_id.clone());
        self.gate.acquire().await.unwrap().forget();

        if self.limit_anthropic && model.family() == "anthropic" {
            return Err(BackendFailure::from_message("429 rate limit exceeded"));
        }
        let prompt = request
            .history
            .last()
            .map(|turn| turn.content().text.clone())
            .unwrap_or_default();
        Ok(BackendResponse::text(format!("re: {prompt}"), 3))
    }
}

fn config(max_concurrent: usize) -> RelayConfig {
    let mut config = RelayConfig::from_toml(
        r#"
        [retry]
        per_model_retries = 1
        backoff_initial_ms = 0
        backoff_max_ms = 0

        [model]
        primary = "anthropic/m1"
        fallbacks = ["openai/m2"]

        [[credentials.profiles]]
        id = "a"
        family = "anthropic"

        [[credentials.profiles]]
        id = "b"
        family = "anthropic"

        [[credentials.profiles]]
        id = "c"
        family = "openai"
        "#,
    )
    .unwrap();
    config.queue.max_concurrent = max_concurrent;
    config
}

#[tokio::test]
async fn test_turns_of_one_session_run_one_at_a_time() {
    let (invoker, mut started) = GatedInvoker::new(false);
    let store = Arc::new(MemorySessionStore::new());
    let relay = Relay::new(config(4), invoker.clone(), store.clone()).unwrap();

    let first = relay.submit_turn(TurnSubmission::new("s1", "one", 2)).unwrap();
    let second = relay.submit_turn(TurnSubmission::new("s1", "two", 2)).unwrap();
    assert_eq!(relay.queue_depth("s1"), 2);

    assert_eq!(started.recv().await.unwrap(), "s1");
    assert_eq!(relay.status(&second.handle), Some(EntryStage::Waiting));
    assert_eq!(relay.in_flight(), 1);

    invoker.open(2);
    let first = first.outcome().await;
    let second = second.outcome().await;
    assert_eq!(first.outcome.unwrap().response.content.text, "re: one");
    assert_eq!(second.outcome.unwrap().response.content.text, "re: two");

    // The second turn saw the first exchange: user, assistant, user.
    let lengths: Vec<usize> = invoker.calls().iter().map(|call| call.3).collect();
    assert_eq!(lengths, vec![1, 3]);
    assert_eq!(store.load("s1").await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_extra_session_waits_for_a_free_slot() {
    let (invoker, mut started) = GatedInvoker::new(false);
    let relay = Relay::new(config(2), invoker.clone(), Arc::new(MemorySessionStore::new())).unwrap();

    let a = relay.submit_turn(TurnSubmission::new("a", "x", 1)).unwrap();
    let b = relay.submit_turn(TurnSubmission::new("b", "x", 1)).unwrap();
    let c = relay.submit_turn(TurnSubmission::new("c", "x", 1)).unwrap();

    started.recv().await.unwrap();
    started.recv().await.unwrap();
    assert_eq!(relay.in_flight(), 2);
    assert_eq!(relay.status(&c.handle), Some(EntryStage::Ready));
    assert_eq!(relay.queue_depth("c"), 1);

    invoker.open(1);
    assert_eq!(started.recv().await.unwrap(), "c");
    invoker.open(2);

    for pending in [a, b, c] {
        assert!(pending.outcome().await.outcome.is_ok());
    }
    assert_eq!(relay.in_flight(), 0);
}

#[tokio::test]
async fn test_canceled_queued_turn_never_reaches_backend() {
    let (invoker, mut started) = GatedInvoker::new(false);
    let relay = Relay::new(config(1), invoker.clone(), Arc::new(MemorySessionStore::new())).unwrap();

    let running = relay.submit_turn(TurnSubmission::new("a", "x", 1)).unwrap();
    let queued = relay.submit_turn(TurnSubmission::new("b", "x", 1)).unwrap();
    started.recv().await.unwrap();

    assert_eq!(relay.cancel(&queued.handle), CancelOutcome::Dequeued);
    assert_eq!(relay.queue_depth("b"), 0);
    let report = queued.outcome().await;
    assert_eq!(report.outcome.unwrap_err().kind(), "canceled");
    assert!(report.attempts.is_empty());

    invoker.open(1);
    let handle = running.handle.clone();
    assert!(running.outcome().await.outcome.is_ok());
    assert_eq!(relay.cancel(&handle), CancelOutcome::NotFound);

    let sessions: Vec<String> = invoker.calls().into_iter().map(|call| call.0).collect();
    assert_eq!(sessions, vec!["a".to_string()]);
}

#[tokio::test]
async fn test_rate_limited_family_falls_back_to_next_model() {
    let invoker = GatedInvoker::rate_limiting_anthropic();
    let relay = Relay::new(config(1), invoker.clone(), Arc::new(MemorySessionStore::new())).unwrap();

    let report = relay
        .submit_turn(TurnSubmission::new("s", "hello", 5))
        .unwrap()
        .outcome()
        .await;

    let success = report.outcome.unwrap();
    assert_eq!(success.model.to_string(), "openai/m2");
    assert_eq!(success.credential, "c");

    let tried: Vec<(String, String)> = report
        .attempts
        .iter()
        .map(|attempt| (attempt.model.clone(), attempt.credential.clone()))
        .collect();
    assert_eq!(
        tried,
        vec![
            ("anthropic/m1".to_string(), "a".to_string()),
            ("anthropic/m1".to_string(), "b".to_string()),
            ("openai/m2".to_string(), "c".to_string()),
        ]
    );
    assert_eq!(report.attempts[0].failure, Some(FailureClass::RateLimit));
    assert!(report.attempts[2].is_success());

    let status = relay.credential_status();
    let cooling: Vec<&str> = status
        .iter()
        .filter(|view| !view.available)
        .map(|view| view.id.as_str())
        .collect();
    assert_eq!(cooling, vec!["a", "b"]);
}

#[tokio::test]
async fn test_subscribers_watch_a_turn_fall_back() {
    let invoker = GatedInvoker::rate_limiting_anthropic();
    let relay = Relay::new(config(1), invoker, Arc::new(MemorySessionStore::new())).unwrap();
    let mut events = relay.subscribe();

    let report = relay
        .submit_turn(TurnSubmission::new("watched", "hello", 5))
        .unwrap()
        .outcome()
        .await;
    assert!(report.outcome.is_ok());

    let mut states = Vec::new();
    let mut retries = Vec::new();
    let mut attempts = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        assert_eq!(event.session(), "watched");
        let done = event.is_terminal();
        match event {
            DispatchEvent::State { state, .. } => states.push(state),
            DispatchEvent::Retry { failure, retry, .. } => retries.push((failure, retry)),
            DispatchEvent::Attempt { credential, .. } => attempts.push(credential),
            _ => {}
        }
        if done {
            break;
        }
    }

    assert_eq!(states.first(), Some(&DispatchState::Admitted));
    assert_eq!(states.last(), Some(&DispatchState::Succeeded));
    assert!(states.contains(&DispatchState::Retrying));
    assert_eq!(retries, vec![(FailureClass::RateLimit, 1)]);
    assert_eq!(attempts, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_exhausted_chain_reports_last_failure() {
    let invoker = GatedInvoker::rate_limiting_anthropic();
    let mut config = config(1);
    config.model.fallbacks.clear();
    let relay = Relay::new(config, invoker, Arc::new(MemorySessionStore::new())).unwrap();

    let report = relay
        .submit_turn(TurnSubmission::new("s", "hello", 5))
        .unwrap()
        .outcome()
        .await;
    assert_eq!(
        report.outcome.unwrap_err(),
        agent_relay::DispatchFailure::Exhausted {
            models: 1,
            last: FailureClass::RateLimit,
        }
    );
    assert_eq!(report.attempts.len(), 2);
}

#[tokio::test]
async fn test_history_survives_relay_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (invoker, _started) = GatedInvoker::new(true);

    let relay = Relay::new(
        config(1),
        invoker.clone(),
        Arc::new(FileSessionStore::new(dir.path())),
    )
    .unwrap();
    let report = relay
        .submit_turn(TurnSubmission::new("disk", "first", 2))
        .unwrap()
        .outcome()
        .await;
    assert!(report.outcome.is_ok());
    drop(relay);

    let store = Arc::new(FileSessionStore::new(dir.path()));
    let relay = Relay::new(config(1), invoker.clone(), store.clone()).unwrap();
    let report = relay
        .submit_turn(TurnSubmission::new("disk", "second", 2))
        .unwrap()
        .outcome()
        .await;
    assert_eq!(report.outcome.unwrap().history.len(), 4);

    let lengths: Vec<usize> = invoker.calls().iter().map(|call| call.3).collect();
    assert_eq!(lengths, vec![1, 3]);
    assert_eq!(store.load("disk").await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_full_queue_rejects_synchronously() {
    let (invoker, mut started) = GatedInvoker::new(false);
    let mut config = config(1);
    config.queue.max_pending = Some(1);
    let relay = Relay::new(config, invoker.clone(), Arc::new(MemorySessionStore::new())).unwrap();

    let running = relay.submit_turn(TurnSubmission::new("a", "x", 1)).unwrap();
    let waiting = relay.submit_turn(TurnSubmission::new("b", "x", 1)).unwrap();
    started.recv().await.unwrap();

    let err = relay
        .submit_turn(TurnSubmission::new("c", "x", 1))
        .unwrap_err();
    assert_eq!(err.kind(), "queue-rejected");

    invoker.open(2);
    assert!(running.outcome().await.outcome.is_ok());
    assert!(waiting.outcome().await.outcome.is_ok());
}

#[tokio::test]
async fn test_missing_family_credentials_fail_without_attempts() {
    let (invoker, _started) = GatedInvoker::new(true);
    let mut config = config(1);
    config.credentials.profiles.retain(|profile| profile.family != "anthropic");
    config.model.fallbacks.clear();
    let relay = Relay::new(config, invoker.clone(), Arc::new(MemorySessionStore::new())).unwrap();

    let report = relay
        .submit_turn(TurnSubmission::new("s", "x", 1))
        .unwrap()
        .outcome()
        .await;
    assert_eq!(report.outcome.unwrap_err().kind(), "credentials-exhausted");
    assert!(report.attempts.is_empty());
    assert!(invoker.calls().is_empty());
}
