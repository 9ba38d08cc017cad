//! Per-dispatch state machine.
//!
//! ```text
//! Admitted -> Attempting -> Succeeded
//!                        -> Retrying   -> Attempting
//!                        -> Compacting -> Attempting
//!                        -> Exhausted
//!          (any transition) -> Canceled
//! ```
//!
//! Cancellation is cooperative: the token is checked before every
//! transition and during backoff sleeps, never in the middle of a backend
//! call. Credential leases never outlive the attempt that took them.

use chrono::Utc;
use relay_config::RelayConfig;
use relay_core::{
    AttemptOutcome, AttemptRecord, DispatchFailure, FailureClass, FallbackChain, ModelTarget,
};
use relay_scheduler::{
    Backoff, ChainCursor, CredentialRotator, ExhaustReason, FallbackResolver, NextStep,
    ReleaseOutcome,
};
use relay_session::{CompactionError, CompactionPolicy, History, Summarizer, compact};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{DispatchEvent, EventBus};
use crate::invoker::{BackendFailure, BackendInvoker, BackendResponse, PreparedRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchState {
    Admitted,
    Attempting,
    Retrying,
    Compacting,
    Succeeded,
    Exhausted,
    Canceled,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted | Self::Canceled)
    }
}

/// Non-terminal states; the loop runs until a step finishes.
#[derive(Debug, Clone, Copy)]
enum Active {
    Admitted,
    Attempting,
    Retrying,
    Compacting,
}

impl From<Active> for DispatchState {
    fn from(active: Active) -> Self {
        match active {
            Active::Admitted => Self::Admitted,
            Active::Attempting => Self::Attempting,
            Active::Retrying => Self::Retrying,
            Active::Compacting => Self::Compacting,
        }
    }
}

enum Step {
    Continue(Active),
    Finish(Result<DispatchSuccess, DispatchFailure>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSuccess {
    pub response: BackendResponse,
    /// History exactly as sent on the successful attempt.
    pub history: History,
    pub model: ModelTarget,
    pub credential: String,
}

/// Terminal result of one dispatch plus every attempt made on the way.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub state: DispatchState,
    pub outcome: Result<DispatchSuccess, DispatchFailure>,
    pub attempts: Vec<AttemptRecord>,
    /// Compaction passes that changed the history.
    pub compactions: u32,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Mutable walk state for one dispatch.
struct Run<'a> {
    session_id: &'a str,
    chain: &'a FallbackChain,
    policy: &'a CompactionPolicy,
    cancel: &'a CancellationToken,
    history: History,
    model: ModelTarget,
    cursor: ChainCursor,
    attempts_on_model: u32,
    /// Credentials that already failed on the current model.
    avoid: Vec<String>,
    retry_hint: Option<Duration>,
    last_failure: Option<BackendFailure>,
    attempts: Vec<AttemptRecord>,
    compactions: u32,
}

#[derive(Clone)]
pub struct Dispatcher {
    invoker: Arc<dyn BackendInvoker>,
    rotator: CredentialRotator,
    resolver: FallbackResolver,
    backoff: Backoff,
    summarizer: Option<Arc<dyn Summarizer>>,
    events: EventBus,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("resolver", &self.resolver)
            .field("backoff", &self.backoff)
            .field("summarizer", &self.summarizer.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(invoker: Arc<dyn BackendInvoker>, rotator: CredentialRotator) -> Self {
        Self {
            invoker,
            rotator,
            resolver: FallbackResolver::default(),
            backoff: Backoff::default(),
            summarizer: None,
            events: EventBus::default(),
        }
    }

    pub fn from_config(
        config: &RelayConfig,
        invoker: Arc<dyn BackendInvoker>,
        rotator: CredentialRotator,
    ) -> Self {
        Self::new(invoker, rotator)
            .with_resolver(FallbackResolver::from_config(&config.retry))
            .with_backoff(Backoff::from_config(&config.retry))
    }

    pub fn with_resolver(mut self, resolver: FallbackResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Share an event bus, e.g. one owned by the caller.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn rotator(&self) -> &CredentialRotator {
        &self.rotator
    }

    /// Progress events of every dispatch run by this dispatcher (and its
    /// clones) from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    fn enter(&self, session_id: &str, state: DispatchState) {
        self.events.publish(DispatchEvent::State {
            session: session_id.to_string(),
            state,
        });
    }

    /// Run one dispatch to a terminal state.
    ///
    /// `history` must already end with the turn being dispatched.
    pub async fn dispatch(
        &self,
        session_id: &str,
        history: History,
        chain: &FallbackChain,
        policy: &CompactionPolicy,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let mut run = Run {
            session_id,
            chain,
            policy,
            cancel,
            history,
            model: chain.primary().clone(),
            cursor: ChainCursor::default(),
            attempts_on_model: 0,
            avoid: Vec::new(),
            retry_hint: None,
            last_failure: None,
            attempts: Vec::new(),
            compactions: 0,
        };

        let mut active = Active::Admitted;
        self.enter(session_id, DispatchState::Admitted);
        let outcome = loop {
            let step = if cancel.is_cancelled() {
                Step::Finish(Err(DispatchFailure::Canceled))
            } else {
                match active {
                    Active::Admitted => self.compact_step(&mut run, policy.token_budget),
                    Active::Attempting => self.attempt(&mut run).await,
                    Active::Retrying => self.back_off(&mut run).await,
                    Active::Compacting => self.compact_step(&mut run, policy.overflow_budget()),
                }
            };
            match step {
                Step::Continue(next) => {
                    debug!(
                        session = %session_id,
                        from = ?DispatchState::from(active),
                        to = ?DispatchState::from(next),
                        "Dispatch transition"
                    );
                    self.enter(session_id, next.into());
                    active = next;
                }
                Step::Finish(outcome) => break outcome,
            }
        };

        let state = match &outcome {
            Ok(_) => DispatchState::Succeeded,
            Err(DispatchFailure::Canceled) => DispatchState::Canceled,
            Err(_) => DispatchState::Exhausted,
        };
        match &outcome {
            Ok(success) => info!(
                session = %session_id,
                model = %success.model,
                credential = %success.credential,
                attempts = run.attempts.len(),
                "Dispatch succeeded"
            ),
            Err(failure) => info!(
                session = %session_id,
                ?state,
                kind = failure.kind(),
                attempts = run.attempts.len(),
                %failure,
                "Dispatch ended without a response"
            ),
        }
        if let Err(failure) = &outcome {
            self.events.publish(DispatchEvent::Error {
                session: session_id.to_string(),
                kind: failure.kind(),
                message: failure.to_string(),
            });
        }
        self.enter(session_id, state);

        DispatchReport {
            state,
            outcome,
            attempts: run.attempts,
            compactions: run.compactions,
        }
    }

    fn compact_step(&self, run: &mut Run<'_>, budget: u64) -> Step {
        match compact(
            &run.history,
            budget,
            &run.policy.strategy,
            self.summarizer.as_deref(),
        ) {
            Ok(compaction) => {
                if compaction.changed() {
                    debug!(
                        session = %run.session_id,
                        dropped = compaction.dropped,
                        before = compaction.tokens_before,
                        after = compaction.tokens_after,
                        "Compacted history before attempt"
                    );
                    self.events.publish(DispatchEvent::Compacted {
                        session: run.session_id.to_string(),
                        dropped: compaction.dropped,
                        tokens_before: compaction.tokens_before,
                        tokens_after: compaction.tokens_after,
                    });
                    run.compactions += 1;
                    run.history = compaction.history;
                }
                Step::Continue(Active::Attempting)
            }
            Err(CompactionError::ContextOverflow { required, budget }) => {
                warn!(session = %run.session_id, required, budget, "History cannot fit budget");
                Step::Finish(Err(DispatchFailure::ContextOverflow { required, budget }))
            }
        }
    }

    async fn back_off(&self, run: &mut Run<'_>) -> Step {
        let delay = self
            .backoff
            .delay(run.cursor.retries_on_model, run.retry_hint.take());
        if let Some(failure) = &run.last_failure {
            self.events.publish(DispatchEvent::Retry {
                session: run.session_id.to_string(),
                model: run.model.to_string(),
                retry: run.cursor.retries_on_model,
                max_retries: self.resolver.per_model_retries(),
                delay_ms: delay.as_millis() as u64,
                failure: failure.class,
                error: failure.message.clone(),
            });
        }
        if !delay.is_zero() {
            debug!(
                session = %run.session_id,
                model = %run.model,
                delay_ms = delay.as_millis() as u64,
                "Backing off before retry"
            );
            tokio::select! {
                _ = run.cancel.cancelled() => return Step::Finish(Err(DispatchFailure::Canceled)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Step::Continue(Active::Attempting)
    }

    async fn attempt(&self, run: &mut Run<'_>) -> Step {
        let lease = match self.rotator.acquire(run.model.family(), &run.avoid) {
            Ok(lease) => lease,
            Err(none) if run.attempts_on_model == 0 => {
                warn!(session = %run.session_id, model = %run.model, %none, "No credential for model");
                return Step::Finish(Err(DispatchFailure::CredentialsExhausted {
                    family: none.family,
                }));
            }
            Err(none) => {
                warn!(session = %run.session_id, model = %run.model, %none, "No credential left for retry");
                let next = self.resolver.advance(run.chain, &mut run.cursor);
                return self.follow(run, next);
            }
        };

        let attempt = run.attempts.len() as u32;
        let credential = lease.id().to_string();
        self.events.publish(DispatchEvent::Attempt {
            session: run.session_id.to_string(),
            attempt,
            model: run.model.to_string(),
            credential: credential.clone(),
        });
        let request = PreparedRequest {
            session_id: run.session_id.to_string(),
            history: run.history.clone(),
        };
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = self
            .invoker
            .invoke(&run.model, lease.credential(), &request)
            .await;
        let elapsed_ms = clock.elapsed().as_millis() as u64;
        run.attempts_on_model += 1;

        match result {
            Ok(response) => {
                self.rotator.release(lease, ReleaseOutcome::Success);
                run.attempts.push(AttemptRecord {
                    attempt,
                    model: run.model.to_string(),
                    credential: credential.clone(),
                    outcome: AttemptOutcome::Success,
                    failure: None,
                    message: None,
                    started_at,
                    elapsed_ms,
                });
                Step::Finish(Ok(DispatchSuccess {
                    response,
                    history: std::mem::take(&mut run.history),
                    model: run.model.clone(),
                    credential,
                }))
            }
            Err(failure) => {
                self.rotator.release(
                    lease,
                    ReleaseOutcome::Failure {
                        class: failure.class,
                        retry_after: failure.retry_after,
                    },
                );
                let next = self
                    .resolver
                    .next_target(run.chain, &mut run.cursor, failure.class);
                let outcome = if matches!(next, NextStep::Exhausted(_)) {
                    AttemptOutcome::FatalFailure
                } else {
                    AttemptOutcome::RetryableFailure
                };
                warn!(
                    session = %run.session_id,
                    attempt,
                    model = %run.model,
                    credential = %credential,
                    class = %failure.class,
                    message = %failure.message,
                    "Backend attempt failed"
                );
                run.attempts.push(AttemptRecord {
                    attempt,
                    model: run.model.to_string(),
                    credential: credential.clone(),
                    outcome,
                    failure: Some(failure.class),
                    message: Some(failure.message.clone()),
                    started_at,
                    elapsed_ms,
                });
                if next == NextStep::RetrySameModel {
                    run.avoid.push(credential);
                }
                run.retry_hint = failure.retry_after;
                run.last_failure = Some(failure);
                self.follow(run, next)
            }
        }
    }

    fn follow(&self, run: &mut Run<'_>, next: NextStep) -> Step {
        match next {
            NextStep::RetrySameModel => Step::Continue(Active::Retrying),
            NextStep::CompactAndRetry => Step::Continue(Active::Compacting),
            NextStep::Advance { model, .. } => {
                run.model = model;
                run.attempts_on_model = 0;
                run.avoid.clear();
                run.retry_hint = None;
                Step::Continue(Active::Attempting)
            }
            NextStep::Exhausted(reason) => Step::Finish(Err(exhausted_failure(run, reason))),
        }
    }
}

fn exhausted_failure(run: &Run<'_>, reason: ExhaustReason) -> DispatchFailure {
    match reason {
        ExhaustReason::ChainExhausted => DispatchFailure::Exhausted {
            models: run.chain.len(),
            last: run
                .last_failure
                .as_ref()
                .map_or(FailureClass::OtherFatal, |failure| failure.class),
        },
        ExhaustReason::Fatal(class) => DispatchFailure::Fatal {
            model: run.model.to_string(),
            message: run
                .last_failure
                .as_ref()
                .map_or_else(|| class.to_string(), |failure| failure.message.clone()),
        },
        ExhaustReason::ContextOverflow => DispatchFailure::ContextOverflow {
            required: run.history.total_cost(),
            budget: run.policy.overflow_budget(),
        },
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
