//! Model leaderboard data, aggregated daily by an external job.
//!
//! The pipeline only reads it: best model per category for
//! `@best-model:` overrides, and ranked candidates per task area for
//! automatic selection. China-origin models can be excluded when the
//! conversation touches topics they censor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub model_id: String,
    pub provider_id: String,
    #[serde(default)]
    pub country_origin: Option<String>,
    #[serde(default)]
    pub composite_score: f64,
    /// Per-category scores (e.g. "coding", "math"); falls back to the
    /// composite score when a category is absent.
    #[serde(default)]
    pub category_scores: BTreeMap<String, f64>,
}

impl LeaderboardEntry {
    pub fn full_model_id(&self) -> String {
        format!("{}/{}", self.provider_id, self.model_id)
    }

    fn score_for(&self, category: &str) -> f64 {
        self.category_scores
            .get(category)
            .copied()
            .unwrap_or(self.composite_score)
    }

    fn is_cn_origin(&self) -> bool {
        self.country_origin.as_deref() == Some("CN")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Leaderboard {
    #[serde(default)]
    pub rankings: Vec<LeaderboardEntry>,
}

impl Leaderboard {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Top entry for a category, best score first.
    pub fn best_for_category(&self, category: &str, exclude_cn: bool) -> Option<&LeaderboardEntry> {
        self.ranked_for(category, exclude_cn).into_iter().next()
    }

    /// All positive-score entries for a category, best first.
    pub fn ranked_for(&self, category: &str, exclude_cn: bool) -> Vec<&LeaderboardEntry> {
        let mut entries: Vec<&LeaderboardEntry> = self
            .rankings
            .iter()
            .filter(|e| e.score_for(category) > 0.0)
            .filter(|e| !(exclude_cn && e.is_cn_origin()))
            .collect();
        entries.sort_by(|a, b| {
            b.score_for(category)
                .partial_cmp(&a.score_for(category))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Leaderboard {
        Leaderboard {
            rankings: vec![
                LeaderboardEntry {
                    model_id: "deepthink-v3".into(),
                    provider_id: "deepseek".into(),
                    country_origin: Some("CN".into()),
                    composite_score: 95.0,
                    category_scores: BTreeMap::from([("code".to_string(), 97.0)]),
                },
                LeaderboardEntry {
                    model_id: "claude-sonnet-4-5".into(),
                    provider_id: "anthropic".into(),
                    country_origin: Some("US".into()),
                    composite_score: 93.0,
                    category_scores: BTreeMap::from([("code".to_string(), 94.0)]),
                },
                LeaderboardEntry {
                    model_id: "gpt-x".into(),
                    provider_id: "openai".into(),
                    country_origin: Some("US".into()),
                    composite_score: 90.0,
                    category_scores: BTreeMap::new(),
                },
            ],
        }
    }

    #[test]
    fn best_for_category_uses_category_score() {
        let board = sample();
        let best = board.best_for_category("code", false).unwrap();
        assert_eq!(best.model_id, "deepthink-v3");
    }

    #[test]
    fn cn_exclusion_changes_winner() {
        let board = sample();
        let best = board.best_for_category("code", true).unwrap();
        assert_eq!(best.full_model_id(), "anthropic/claude-sonnet-4-5");
    }

    #[test]
    fn missing_category_falls_back_to_composite() {
        let board = sample();
        let ranked = board.ranked_for("poetry", true);
        assert_eq!(ranked[0].model_id, "claude-sonnet-4-5");
        assert_eq!(ranked[1].model_id, "gpt-x");
    }
}
