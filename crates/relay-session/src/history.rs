use relay_core::{Role, Turn};
use serde::{Deserialize, Serialize};

/// Ordered turns of one session, oldest first.
///
/// Append-only for callers. Compaction produces a new `History` rather than
/// editing this one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    turns: Vec<Turn>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Sum of the precomputed per-turn token estimates.
    pub fn total_cost(&self) -> u64 {
        self.turns.iter().map(Turn::token_cost).sum()
    }

    pub fn fits(&self, budget: u64) -> bool {
        self.total_cost() <= budget
    }

    /// True when the first turn is a system turn and not also the newest one.
    pub fn has_leading_system(&self) -> bool {
        self.turns.len() > 1 && self.turns[0].role() == Role::System
    }

    /// Whether every turn of `self` appears in `other`, in the same order.
    pub fn is_subsequence_of(&self, other: &History) -> bool {
        let mut remaining = other.turns.iter();
        self.turns
            .iter()
            .all(|turn| remaining.any(|candidate| candidate.id() == turn.id()))
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }
}

impl FromIterator<Turn> for History {
    fn from_iter<I: IntoIterator<Item = Turn>>(iter: I) -> Self {
        Self {
            turns: iter.into_iter().collect(),
        }
    }
}
