use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::{
    BestModelPair, EvaluationCriterion, EvaluationResult, LeaderboardEntry, PromptVariation,
    ProviderKind,
};

fn mean(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

/// Highest single result wins, attributed to the model configured on that
/// result's criterion. Ties keep the earlier (lower-ID) result.
fn best_model_pair(rows: &[&EvaluationResult], criteria: &[EvaluationCriterion]) -> BestModelPair {
    let mut best = BestModelPair {
        provider: ProviderKind::OpenAi,
        model: String::new(),
        score: 0.0,
    };
    for row in rows {
        if row.score <= best.score {
            continue;
        }
        best.score = row.score;
        // A deleted criterion keeps the previous attribution.
        if let Some(criterion) = criteria.iter().find(|c| c.id == row.criterion_id) {
            best.provider = criterion.model_config.provider;
            best.model = criterion.model_config.model.clone();
        }
    }
    best
}

fn entry_for(
    variation: &PromptVariation,
    criteria: &[EvaluationCriterion],
    results: &[EvaluationResult],
) -> LeaderboardEntry {
    let mut rows: Vec<&EvaluationResult> = results
        .iter()
        .filter(|r| r.variation_id == variation.id)
        .collect();
    rows.sort_by_key(|r| r.id);

    let mut scores = BTreeMap::new();
    for criterion in criteria {
        let per_criterion: Vec<f64> = rows
            .iter()
            .filter(|r| r.criterion_id == criterion.id)
            .map(|r| r.score)
            .collect();
        if let Some(avg) = mean(&per_criterion) {
            scores.insert(criterion.name.clone(), avg);
        }
    }

    let values: Vec<f64> = scores.values().copied().collect();
    LeaderboardEntry {
        variation_id: variation.id,
        content: variation.content.clone(),
        average_score: mean(&values).unwrap_or(f64::NAN),
        scores,
        best_model_pair: best_model_pair(&rows, criteria),
    }
}

/// Unevaluated entries (NaN average) sort after every scored one.
fn by_average_desc(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    match (a.is_evaluated(), b.is_evaluated()) {
        (true, true) => b.average_score.total_cmp(&a.average_score),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => Ordering::Equal,
    }
}

/// Rank `variations` by their mean per-criterion score, best first. Equal
/// averages keep variation ID order.
pub fn build_leaderboard(
    variations: &[PromptVariation],
    criteria: &[EvaluationCriterion],
    results: &[EvaluationResult],
) -> Vec<LeaderboardEntry> {
    let mut ordered: Vec<&PromptVariation> = variations.iter().collect();
    ordered.sort_by_key(|v| v.id);

    let mut entries: Vec<LeaderboardEntry> = ordered
        .into_iter()
        .map(|v| entry_for(v, criteria, results))
        .collect();
    entries.sort_by(by_average_desc);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;

    fn variation(id: u64) -> PromptVariation {
        PromptVariation {
            id,
            meta_prompt_id: 1,
            content: format!("variation {}", id),
            model_config: ModelConfig::for_provider(ProviderKind::OpenAi),
        }
    }

    fn criterion(id: u64, name: &str, provider: ProviderKind, model: &str) -> EvaluationCriterion {
        EvaluationCriterion {
            id,
            name: name.into(),
            description: String::new(),
            weight: 1.0,
            model_config: ModelConfig::new(provider, model),
        }
    }

    fn result(id: u64, variation_id: u64, criterion_id: u64, score: f64) -> EvaluationResult {
        EvaluationResult {
            id,
            variation_id,
            test_case_id: 1,
            criterion_id,
            score,
            response: String::new(),
            evaluator_model: "A+B".into(),
            degraded_agents: 0,
        }
    }

    fn criteria() -> Vec<EvaluationCriterion> {
        vec![
            criterion(1, "Clarity", ProviderKind::OpenAi, "gpt-4o"),
            criterion(2, "Safety", ProviderKind::Anthropic, "claude-3-5-sonnet-20241022"),
        ]
    }

    #[test]
    fn test_ranks_higher_average_first() {
        let results = vec![result(1, 1, 1, 6.9), result(2, 2, 1, 7.2)];
        let board = build_leaderboard(&[variation(1), variation(2)], &criteria(), &results);
        assert_eq!(board[0].variation_id, 2);
        assert_eq!(board[0].average_score, 7.2);
        assert_eq!(board[1].variation_id, 1);
    }

    #[test]
    fn test_average_of_criterion_means() {
        let results = vec![
            result(1, 1, 1, 6.0),
            result(2, 1, 1, 8.0),
            result(3, 1, 2, 4.0),
        ];
        let board = build_leaderboard(&[variation(1)], &criteria(), &results);
        let entry = &board[0];
        assert_eq!(entry.scores["Clarity"], 7.0);
        assert_eq!(entry.scores["Safety"], 4.0);
        assert_eq!(entry.average_score, 5.5);
    }

    #[test]
    fn test_best_model_uses_criterion_config() {
        let results = vec![
            result(1, 1, 1, 6.0),
            result(2, 1, 2, 9.0),
            result(3, 1, 1, 9.0),
        ];
        let board = build_leaderboard(&[variation(1)], &criteria(), &results);
        let best = &board[0].best_model_pair;
        assert_eq!(best.provider, ProviderKind::Anthropic);
        assert_eq!(best.model, "claude-3-5-sonnet-20241022");
        assert_eq!(best.score, 9.0);
    }

    #[test]
    fn test_unevaluated_sorts_last() {
        let results = vec![result(1, 2, 1, 2.0)];
        let board = build_leaderboard(&[variation(1), variation(2)], &criteria(), &results);
        assert_eq!(board[0].variation_id, 2);
        assert!(board[1].average_score.is_nan());
        assert!(board[1].scores.is_empty());
        assert_eq!(board[1].best_model_pair.score, 0.0);
        assert_eq!(board[1].best_model_pair.provider, ProviderKind::OpenAi);
        assert!(board[1].best_model_pair.model.is_empty());
    }

    #[test]
    fn test_ties_keep_id_order() {
        let results = vec![result(1, 3, 1, 7.0), result(2, 1, 1, 7.0)];
        let board = build_leaderboard(&[variation(3), variation(1)], &criteria(), &results);
        assert_eq!(board[0].variation_id, 1);
        assert_eq!(board[1].variation_id, 3);
    }

    #[test]
    fn test_ignores_other_variations_results() {
        let results = vec![result(1, 99, 1, 10.0)];
        let board = build_leaderboard(&[variation(1)], &criteria(), &results);
        assert_eq!(board.len(), 1);
        assert!(!board[0].is_evaluated());
    }
}
