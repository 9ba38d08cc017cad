//! Context compaction: prune a session history to fit a token budget.
//!
//! Costs come from each turn's precomputed estimate; nothing is recounted
//! here. Every strategy keeps the newest turn, since it is the one being
//! dispatched. When that is impossible the result is a context overflow,
//! never an empty request.

use relay_config::{CompactionConfig, CompactionStrategyName};
use relay_core::Turn;
use tracing::debug;

use crate::history::History;

/// Pruning strategy. Closed set, dispatched by `match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    /// Drop oldest turns first, keeping a leading system turn while possible.
    KeepRecent,
    /// Keep every high-importance turn, drop normal turns oldest first.
    KeepImportant,
    /// Keep the first `keep_first` and last `keep_last` turns; replace the
    /// span between them with a single summary turn.
    SlidingWindow { keep_first: usize, keep_last: usize },
}

impl CompactionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeepRecent => "keep-recent",
            Self::KeepImportant => "keep-important",
            Self::SlidingWindow { .. } => "sliding-window",
        }
    }
}

/// Strategy plus the budget it works against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionPolicy {
    pub strategy: CompactionStrategy,
    pub token_budget: u64,
    /// Fraction of `token_budget` targeted after the backend reported an
    /// overflow for a history that already fit.
    pub overflow_budget_ratio: f64,
}

impl CompactionPolicy {
    pub fn new(strategy: CompactionStrategy, token_budget: u64) -> Self {
        Self {
            strategy,
            token_budget,
            overflow_budget_ratio: 0.75,
        }
    }

    pub fn from_config(config: &CompactionConfig) -> Self {
        let strategy = match config.strategy {
            CompactionStrategyName::KeepRecent => CompactionStrategy::KeepRecent,
            CompactionStrategyName::KeepImportant => CompactionStrategy::KeepImportant,
            CompactionStrategyName::SlidingWindow => CompactionStrategy::SlidingWindow {
                keep_first: config.keep_first,
                keep_last: config.keep_last,
            },
        };
        Self {
            strategy,
            token_budget: config.token_budget,
            overflow_budget_ratio: config.overflow_budget_ratio,
        }
    }

    /// Tightened budget used for the single compaction after an overflow.
    pub fn overflow_budget(&self) -> u64 {
        let scaled = (self.token_budget as f64 * self.overflow_budget_ratio).floor() as u64;
        scaled.clamp(1, self.token_budget.max(1))
    }
}

/// Text standing in for the span dropped by sliding-window compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub text: String,
    pub token_cost: u64,
}

/// Caller-provided summarizer for sliding-window compaction.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, dropped: &[Turn]) -> Summary;
}

impl<F> Summarizer for F
where
    F: Fn(&[Turn]) -> Summary + Send + Sync,
{
    fn summarize(&self, dropped: &[Turn]) -> Summary {
        self(dropped)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactionError {
    /// The turns compaction may not drop already exceed the budget.
    #[error("Context overflow: {required} tokens cannot be dropped, budget is {budget}")]
    ContextOverflow { required: u64, budget: u64 },
}

/// Result of a compaction pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Compaction {
    pub history: History,
    pub dropped: usize,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub summary_inserted: bool,
}

impl Compaction {
    fn unchanged(history: &History) -> Self {
        let tokens = history.total_cost();
        Self {
            history: history.clone(),
            dropped: 0,
            tokens_before: tokens,
            tokens_after: tokens,
            summary_inserted: false,
        }
    }

    pub fn changed(&self) -> bool {
        self.dropped > 0 || self.summary_inserted
    }
}

/// Prune `history` to fit `budget` under `strategy`.
///
/// Returns the history unchanged when it already fits. The result is a
/// subsequence of the input, except for the one summary turn sliding-window
/// may insert at the window boundary.
pub fn compact(
    history: &History,
    budget: u64,
    strategy: &CompactionStrategy,
    summarizer: Option<&dyn Summarizer>,
) -> Result<Compaction, CompactionError> {
    if history.fits(budget) {
        return Ok(Compaction::unchanged(history));
    }

    let result = match strategy {
        CompactionStrategy::KeepRecent => keep_recent(history, budget),
        CompactionStrategy::KeepImportant => keep_important(history, budget),
        CompactionStrategy::SlidingWindow {
            keep_first,
            keep_last,
        } => sliding_window(history, budget, *keep_first, *keep_last, summarizer),
    };

    match &result {
        Ok(compaction) => debug!(
            strategy = strategy.name(),
            budget,
            dropped = compaction.dropped,
            before = compaction.tokens_before,
            after = compaction.tokens_after,
            "Compacted session history"
        ),
        Err(err) => debug!(strategy = strategy.name(), budget, %err, "Compaction failed"),
    }
    result
}

fn keep_recent(history: &History, budget: u64) -> Result<Compaction, CompactionError> {
    let turns = history.turns();
    let newest = turns.len() - 1;
    let newest_cost = turns[newest].token_cost();
    if newest_cost > budget {
        return Err(CompactionError::ContextOverflow {
            required: newest_cost,
            budget,
        });
    }

    let mut keep = vec![true; turns.len()];
    let mut total = history.total_cost();
    let first_droppable = usize::from(history.has_leading_system());

    for index in first_droppable..newest {
        if total <= budget {
            break;
        }
        keep[index] = false;
        total -= turns[index].token_cost();
    }

    // The leading system turn goes only when nothing else is left to drop.
    if total > budget && first_droppable == 1 {
        keep[0] = false;
        total -= turns[0].token_cost();
    }

    Ok(retain(history, &keep))
}

fn keep_important(history: &History, budget: u64) -> Result<Compaction, CompactionError> {
    let turns = history.turns();
    let newest = turns.len() - 1;

    let required: u64 = turns
        .iter()
        .enumerate()
        .filter(|(index, turn)| turn.is_pinned() || *index == newest)
        .map(|(_, turn)| turn.token_cost())
        .sum();
    if required > budget {
        return Err(CompactionError::ContextOverflow { required, budget });
    }

    let mut keep = vec![true; turns.len()];
    let mut total = history.total_cost();
    for (index, turn) in turns.iter().enumerate().take(newest) {
        if total <= budget {
            break;
        }
        if turn.is_pinned() {
            continue;
        }
        keep[index] = false;
        total -= turn.token_cost();
    }

    Ok(retain(history, &keep))
}

fn sliding_window(
    history: &History,
    budget: u64,
    keep_first: usize,
    keep_last: usize,
    summarizer: Option<&dyn Summarizer>,
) -> Result<Compaction, CompactionError> {
    let turns = history.turns();
    let len = turns.len();
    let tokens_before = history.total_cost();

    // The newest turn always belongs to the tail window.
    let head_len = keep_first.min(len - 1);
    let mut tail_len = keep_last.max(1).min(len - head_len);
    let head_cost: u64 = turns[..head_len].iter().map(Turn::token_cost).sum();

    loop {
        let tail_start = len - tail_len;
        let dropped = &turns[head_len..tail_start];
        let summary = if dropped.is_empty() {
            None
        } else {
            Some(summarizer.map(|s| s.summarize(dropped)).unwrap_or_default())
        };
        let summary_cost = summary.as_ref().map_or(0, |s| s.token_cost);
        let tail_cost: u64 = turns[tail_start..].iter().map(Turn::token_cost).sum();
        let total = head_cost + summary_cost + tail_cost;

        if total <= budget {
            let mut kept = Vec::with_capacity(head_len + tail_len + 1);
            kept.extend_from_slice(&turns[..head_len]);
            let summary_inserted = summary.is_some();
            if let Some(summary) = summary {
                kept.push(Turn::summary(summary.text, summary.token_cost));
            }
            kept.extend_from_slice(&turns[tail_start..]);
            return Ok(Compaction {
                history: History::from_turns(kept),
                dropped: dropped.len(),
                tokens_before,
                tokens_after: total,
                summary_inserted,
            });
        }

        if tail_len == 1 {
            return Err(CompactionError::ContextOverflow {
                required: total,
                budget,
            });
        }
        tail_len -= 1;
    }
}

fn retain(history: &History, keep: &[bool]) -> Compaction {
    let tokens_before = history.total_cost();
    let kept: History = history
        .turns()
        .iter()
        .zip(keep)
        .filter(|(_, keep)| **keep)
        .map(|(turn, _)| turn.clone())
        .collect();
    Compaction {
        dropped: history.len() - kept.len(),
        tokens_before,
        tokens_after: kept.total_cost(),
        history: kept,
        summary_inserted: false,
    }
}

#[cfg(test)]
#[path = "compact_tests.rs"]
mod tests;
