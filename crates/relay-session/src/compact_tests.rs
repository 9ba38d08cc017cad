use super::*;
use proptest::prelude::*;
use relay_core::{Importance, Role, TurnKind};

fn user(cost: u64) -> Turn {
    Turn::user(format!("user-{cost}"), cost)
}

fn pinned(cost: u64) -> Turn {
    Turn::user("pinned", cost).with_importance(Importance::High)
}

fn costs(history: &History) -> Vec<u64> {
    history.turns().iter().map(Turn::token_cost).collect()
}

fn fixed_summary(text: &'static str, token_cost: u64) -> impl Fn(&[Turn]) -> Summary {
    move |_dropped: &[Turn]| Summary {
        text: text.to_string(),
        token_cost,
    }
}

#[test]
fn test_history_within_budget_is_untouched() {
    let history = History::from_turns(vec![Turn::system("sys", 5), user(5), user(5)]);
    for strategy in [
        CompactionStrategy::KeepRecent,
        CompactionStrategy::KeepImportant,
        CompactionStrategy::SlidingWindow {
            keep_first: 1,
            keep_last: 1,
        },
    ] {
        let result = compact(&history, 15, &strategy, None).unwrap();
        assert_eq!(result.history, history);
        assert!(!result.changed());
    }
}

#[test]
fn test_keep_recent_drops_oldest_after_system() {
    let system = Turn::system("sys", 10);
    let history = History::from_turns(vec![system.clone(), user(20), user(30), user(5), user(7)]);
    let result = compact(&history, 25, &CompactionStrategy::KeepRecent, None).unwrap();

    assert_eq!(result.history.turns()[0].id(), system.id());
    assert_eq!(costs(&result.history), vec![10, 5, 7]);
    assert_eq!(result.dropped, 2);
    assert_eq!(result.tokens_before, 72);
    assert_eq!(result.tokens_after, 22);
    assert!(result.history.is_subsequence_of(&history));
}

#[test]
fn test_keep_recent_drops_system_as_last_resort() {
    let history = History::from_turns(vec![Turn::system("sys", 10), user(4), user(12)]);
    let result = compact(&history, 15, &CompactionStrategy::KeepRecent, None).unwrap();
    assert_eq!(costs(&result.history), vec![12]);
    assert_eq!(result.history.turns()[0].role(), Role::User);
}

#[test]
fn test_keep_recent_newest_over_budget_is_overflow() {
    let history = History::from_turns(vec![user(3), user(50)]);
    let err = compact(&history, 40, &CompactionStrategy::KeepRecent, None).unwrap_err();
    assert_eq!(
        err,
        CompactionError::ContextOverflow {
            required: 50,
            budget: 40
        }
    );
}

#[test]
fn test_keep_important_never_drops_pinned() {
    let system = Turn::system("sys", 10);
    let pin = pinned(10);
    let history = History::from_turns(vec![system.clone(), user(20), pin.clone(), user(20), user(5)]);
    let result = compact(&history, 30, &CompactionStrategy::KeepImportant, None).unwrap();

    let ids: Vec<_> = result.history.turns().iter().map(Turn::id).collect();
    assert!(ids.contains(&system.id()));
    assert!(ids.contains(&pin.id()));
    assert_eq!(costs(&result.history), vec![10, 10, 5]);
    assert!(result.history.is_subsequence_of(&history));
}

#[test]
fn test_keep_important_pinned_over_budget_is_overflow() {
    let history = History::from_turns(vec![Turn::system("sys", 30), pinned(30), user(1)]);
    let err = compact(&history, 50, &CompactionStrategy::KeepImportant, None).unwrap_err();
    assert_eq!(
        err,
        CompactionError::ContextOverflow {
            required: 61,
            budget: 50
        }
    );
}

#[test]
fn test_keep_important_keeps_newest_normal_turn() {
    let history = History::from_turns(vec![user(10), user(10), user(10)]);
    let result = compact(&history, 10, &CompactionStrategy::KeepImportant, None).unwrap();
    assert_eq!(result.history.len(), 1);
    assert_eq!(
        result.history.last().unwrap().id(),
        history.last().unwrap().id()
    );
}

#[test]
fn test_sliding_window_inserts_summary_at_boundary() {
    let history = History::from_turns(vec![
        Turn::system("sys", 5),
        user(10),
        user(10),
        user(10),
        user(3),
        user(4),
    ]);
    let summarizer = fixed_summary("earlier: three questions", 2);
    let strategy = CompactionStrategy::SlidingWindow {
        keep_first: 1,
        keep_last: 2,
    };
    let result = compact(&history, 20, &strategy, Some(&summarizer)).unwrap();

    let turns = result.history.turns();
    assert_eq!(turns.len(), 4);
    assert_eq!(turns[0].id(), history.turns()[0].id());
    assert_eq!(turns[1].kind(), TurnKind::Summary);
    assert_eq!(turns[1].content().text, "earlier: three questions");
    assert_eq!(turns[2].id(), history.turns()[4].id());
    assert_eq!(turns[3].id(), history.turns()[5].id());
    assert!(result.summary_inserted);
    assert_eq!(result.dropped, 3);
    assert_eq!(result.tokens_after, 14);
}

#[test]
fn test_sliding_window_without_summarizer_inserts_empty_turn() {
    let history = History::from_turns(vec![user(5), user(10), user(10), user(5)]);
    let strategy = CompactionStrategy::SlidingWindow {
        keep_first: 1,
        keep_last: 1,
    };
    let result = compact(&history, 12, &strategy, None).unwrap();
    let summary = &result.history.turns()[1];
    assert_eq!(summary.kind(), TurnKind::Summary);
    assert!(summary.content().is_empty());
    assert_eq!(summary.token_cost(), 0);
}

#[test]
fn test_sliding_window_shrinks_tail_to_fit() {
    let history = History::from_turns(vec![user(2), user(8), user(8), user(8), user(3)]);
    let strategy = CompactionStrategy::SlidingWindow {
        keep_first: 1,
        keep_last: 3,
    };
    let result = compact(&history, 6, &strategy, None).unwrap();
    assert_eq!(costs(&result.history), vec![2, 0, 3]);
    assert_eq!(result.dropped, 3);
}

#[test]
fn test_sliding_window_overflow_when_head_and_newest_exceed() {
    let history = History::from_turns(vec![Turn::system("sys", 20), user(5), user(25)]);
    let strategy = CompactionStrategy::SlidingWindow {
        keep_first: 1,
        keep_last: 4,
    };
    let err = compact(&history, 30, &strategy, None).unwrap_err();
    assert!(matches!(
        err,
        CompactionError::ContextOverflow { required: 45, budget: 30 }
    ));
}

#[test]
fn test_only_sliding_window_synthesizes_turns() {
    let history = History::from_turns(vec![user(10), user(10), user(10), user(10)]);
    for strategy in [CompactionStrategy::KeepRecent, CompactionStrategy::KeepImportant] {
        let result = compact(&history, 20, &strategy, None).unwrap();
        assert!(!result.summary_inserted);
        assert!(result
            .history
            .turns()
            .iter()
            .all(|turn| turn.kind() == TurnKind::Message));
    }
}

#[test]
fn test_policy_from_config() {
    let config = relay_config::CompactionConfig {
        strategy: CompactionStrategyName::SlidingWindow,
        token_budget: 1000,
        keep_first: 2,
        keep_last: 8,
        overflow_budget_ratio: 0.5,
    };
    let policy = CompactionPolicy::from_config(&config);
    assert_eq!(
        policy.strategy,
        CompactionStrategy::SlidingWindow {
            keep_first: 2,
            keep_last: 8
        }
    );
    assert_eq!(policy.overflow_budget(), 500);
}

#[test]
fn test_overflow_budget_never_zero() {
    let mut policy = CompactionPolicy::new(CompactionStrategy::KeepRecent, 1);
    policy.overflow_budget_ratio = 0.1;
    assert_eq!(policy.overflow_budget(), 1);
}

fn arb_history() -> impl Strategy<Value = History> {
    prop::collection::vec((1u64..60, any::<bool>(), any::<bool>()), 1..24).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(index, (cost, is_system, is_high))| {
                if index == 0 && is_system {
                    Turn::system("sys", cost)
                } else if is_high {
                    pinned(cost)
                } else {
                    user(cost)
                }
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_keep_recent_fits_or_overflows_on_newest(history in arb_history(), budget in 1u64..400) {
        let newest = history.last().unwrap().clone();
        match compact(&history, budget, &CompactionStrategy::KeepRecent, None) {
            Ok(result) => {
                prop_assert!(result.history.total_cost() <= budget);
                prop_assert!(result.history.is_subsequence_of(&history));
                prop_assert_eq!(result.history.last().unwrap().id(), newest.id());
            }
            Err(CompactionError::ContextOverflow { .. }) => {
                prop_assert!(newest.token_cost() > budget);
            }
        }
    }

    #[test]
    fn prop_keep_important_retains_every_pinned_turn(history in arb_history(), budget in 1u64..400) {
        let pinned_cost: u64 = history.turns().iter().filter(|t| t.is_pinned()).map(Turn::token_cost).sum();
        match compact(&history, budget, &CompactionStrategy::KeepImportant, None) {
            Ok(result) => {
                prop_assert!(result.history.total_cost() <= budget);
                prop_assert!(result.history.is_subsequence_of(&history));
                for turn in history.turns().iter().filter(|t| t.is_pinned()) {
                    prop_assert!(result.history.turns().iter().any(|kept| kept.id() == turn.id()));
                }
            }
            Err(CompactionError::ContextOverflow { required, .. }) => {
                prop_assert!(required > budget);
                prop_assert!(required >= pinned_cost);
            }
        }
    }

    #[test]
    fn prop_sliding_window_inserts_at_most_one_summary(history in arb_history(), budget in 1u64..400) {
        let strategy = CompactionStrategy::SlidingWindow { keep_first: 1, keep_last: 4 };
        if let Ok(result) = compact(&history, budget, &strategy, None) {
            let summaries = result.history.turns().iter().filter(|t| t.kind() == TurnKind::Summary).count();
            prop_assert!(summaries <= 1);
            prop_assert!(result.history.total_cost() <= budget);
            let originals: History = result
                .history
                .turns()
                .iter()
                .filter(|t| t.kind() == TurnKind::Message)
                .cloned()
                .collect();
            prop_assert!(originals.is_subsequence_of(&history));
            prop_assert_eq!(result.history.last().unwrap().id(), history.last().unwrap().id());
        }
    }
}
