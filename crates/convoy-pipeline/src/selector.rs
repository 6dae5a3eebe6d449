//! Leaderboard-backed model selection.
//!
//! Keyed by `(task_area, complexity, china_related, user_unhappy)`:
//! complex requests and unhappy users get the strongest ranked model for
//! the task area; simple requests step down a rank to a cheaper candidate.
//! Always yields a secondary and fallback when the board has enough depth.

use convoy_core::types::{Complexity, TaskArea};

use crate::leaderboard::Leaderboard;

#[derive(Debug, Clone)]
pub struct ModelSelection {
    pub primary_model_id: String,
    pub secondary_model_id: Option<String>,
    pub fallback_model_id: Option<String>,
    pub selection_reason: String,
    pub filtered_cn_models: bool,
}

pub struct ModelSelector<'a> {
    leaderboard: &'a Leaderboard,
}

impl<'a> ModelSelector<'a> {
    pub fn new(leaderboard: &'a Leaderboard) -> Self {
        Self { leaderboard }
    }

    /// `None` when the board has no usable entry for the task area.
    pub fn select_models(
        &self,
        task_area: TaskArea,
        complexity: Complexity,
        china_related: bool,
        user_unhappy: bool,
    ) -> Option<ModelSelection> {
        let ranked = self
            .leaderboard
            .ranked_for(task_area.as_str(), china_related);
        if ranked.is_empty() {
            return None;
        }

        // Simple requests step one rank down unless the user is already
        // unhappy with the answers they got.
        let start = if complexity == Complexity::Simple && !user_unhappy {
            1.min(ranked.len() - 1)
        } else {
            0
        };

        let primary = ranked[start];
        let secondary = ranked.get(start + 1);
        let fallback = ranked.get(start + 2);

        let selection_reason = format!(
            "leaderboard rank {} for task_area={}, complexity={:?}, china_related={}, user_unhappy={}",
            start + 1,
            task_area.as_str(),
            complexity,
            china_related,
            user_unhappy,
        );

        Some(ModelSelection {
            primary_model_id: primary.full_model_id(),
            secondary_model_id: secondary.map(|e| e.full_model_id()),
            fallback_model_id: fallback.map(|e| e.full_model_id()),
            selection_reason,
            filtered_cn_models: china_related,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard::LeaderboardEntry;
    use std::collections::BTreeMap;

    fn board() -> Leaderboard {
        Leaderboard {
            rankings: vec![
                LeaderboardEntry {
                    model_id: "top".into(),
                    provider_id: "a".into(),
                    country_origin: Some("US".into()),
                    composite_score: 99.0,
                    category_scores: BTreeMap::new(),
                },
                LeaderboardEntry {
                    model_id: "mid".into(),
                    provider_id: "b".into(),
                    country_origin: Some("CN".into()),
                    composite_score: 95.0,
                    category_scores: BTreeMap::new(),
                },
                LeaderboardEntry {
                    model_id: "low".into(),
                    provider_id: "c".into(),
                    country_origin: Some("US".into()),
                    composite_score: 90.0,
                    category_scores: BTreeMap::new(),
                },
            ],
        }
    }

    #[test]
    fn complex_requests_take_the_top_model() {
        let board = board();
        let selection = ModelSelector::new(&board)
            .select_models(TaskArea::General, Complexity::Complex, false, false)
            .unwrap();
        assert_eq!(selection.primary_model_id, "a/top");
        assert_eq!(selection.secondary_model_id.as_deref(), Some("b/mid"));
        assert_eq!(selection.fallback_model_id.as_deref(), Some("c/low"));
    }

    #[test]
    fn simple_requests_step_down_one_rank() {
        let board = board();
        let selection = ModelSelector::new(&board)
            .select_models(TaskArea::General, Complexity::Simple, false, false)
            .unwrap();
        assert_eq!(selection.primary_model_id, "b/mid");
    }

    #[test]
    fn unhappy_user_escalates_back_to_top() {
        let board = board();
        let selection = ModelSelector::new(&board)
            .select_models(TaskArea::General, Complexity::Simple, false, true)
            .unwrap();
        assert_eq!(selection.primary_model_id, "a/top");
    }

    #[test]
    fn china_related_filters_cn_models() {
        let board = board();
        let selection = ModelSelector::new(&board)
            .select_models(TaskArea::General, Complexity::Complex, true, false)
            .unwrap();
        assert_eq!(selection.primary_model_id, "a/top");
        assert_eq!(selection.secondary_model_id.as_deref(), Some("c/low"));
        assert!(selection.filtered_cn_models);
    }

    #[test]
    fn empty_board_yields_none() {
        let board = Leaderboard::default();
        assert!(ModelSelector::new(&board)
            .select_models(TaskArea::Code, Complexity::Complex, false, false)
            .is_none());
    }
}
