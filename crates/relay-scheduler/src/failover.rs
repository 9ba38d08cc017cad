//! Fallback-chain decisions after a failed attempt.
//!
//! The resolver is stateless apart from its retry ceiling. The dispatcher
//! owns a [`ChainCursor`] and passes it in; every decision updates the cursor
//! so the next call sees where the walk stands.

use relay_config::RetryConfig;
use relay_core::{FailureClass, FallbackChain, ModelTarget};
use tracing::info;

/// Position of one dispatch within its fallback chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainCursor {
    pub index: usize,
    /// Same-model retries already spent on `index`.
    pub retries_on_model: u32,
    /// Overflow compactions already spent on `index`.
    pub compactions_on_model: u32,
}

/// Why the chain cannot continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    /// Every model in the chain was tried.
    ChainExhausted,
    /// A failure class that no other target can fix.
    Fatal(FailureClass),
    /// The backend still overflowed after compacting for this model.
    ContextOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Acquire another credential and retry the current model.
    RetrySameModel,
    /// Move on to the next model in the chain.
    Advance { index: usize, model: ModelTarget },
    /// Compact the history to the overflow budget and retry the current
    /// model with the same credential.
    CompactAndRetry,
    Exhausted(ExhaustReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackResolver {
    per_model_retries: u32,
}

impl Default for FallbackResolver {
    fn default() -> Self {
        Self::new(1)
    }
}

impl FallbackResolver {
    pub fn new(per_model_retries: u32) -> Self {
        Self { per_model_retries }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.per_model_retries)
    }

    pub fn per_model_retries(&self) -> u32 {
        self.per_model_retries
    }

    /// Decide what follows a failure of class `failure` at `cursor`.
    pub fn next_target(
        &self,
        chain: &FallbackChain,
        cursor: &mut ChainCursor,
        failure: FailureClass,
    ) -> NextStep {
        match failure {
            FailureClass::ContextOverflow => {
                if cursor.compactions_on_model == 0 {
                    cursor.compactions_on_model += 1;
                    NextStep::CompactAndRetry
                } else {
                    NextStep::Exhausted(ExhaustReason::ContextOverflow)
                }
            }
            FailureClass::ModelUnavailable => self.advance(chain, cursor),
            class if class.is_chain_retryable() => {
                if cursor.retries_on_model < self.per_model_retries {
                    cursor.retries_on_model += 1;
                    NextStep::RetrySameModel
                } else {
                    self.advance(chain, cursor)
                }
            }
            class => NextStep::Exhausted(ExhaustReason::Fatal(class)),
        }
    }

    /// Skip to the next model regardless of remaining retries, e.g. when no
    /// credential is left for a same-model retry.
    pub fn advance(&self, chain: &FallbackChain, cursor: &mut ChainCursor) -> NextStep {
        let next = cursor.index + 1;
        match chain.get(next) {
            Some(model) => {
                info!(
                    from = cursor.index,
                    to = next,
                    model = %model,
                    "Advancing fallback chain"
                );
                *cursor = ChainCursor {
                    index: next,
                    ..ChainCursor::default()
                };
                NextStep::Advance {
                    index: next,
                    model: model.clone(),
                }
            }
            None => NextStep::Exhausted(ExhaustReason::ChainExhausted),
        }
    }
}
