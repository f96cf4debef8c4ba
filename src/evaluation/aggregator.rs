use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::PipelineError;
use crate::model::{AgentEvaluationResult, CellKey, EvaluationResult};

/// How placeholder rows are folded into a cell score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Plain mean over every row, placeholders included.
    #[default]
    Blend,
    /// Mean over scored rows only. A cell with nothing but placeholders
    /// still blends.
    ExcludeDegraded,
}

impl fmt::Display for DegradedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedPolicy::Blend => f.pad("blend"),
            DegradedPolicy::ExcludeDegraded => f.pad("exclude"),
        }
    }
}

impl FromStr for DegradedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blend" => Ok(DegradedPolicy::Blend),
            "exclude" | "exclude_degraded" => Ok(DegradedPolicy::ExcludeDegraded),
            other => Err(format!("unknown degraded policy: {}", other)),
        }
    }
}

fn mean(scores: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = scores.fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn render_response(rows: &[&AgentEvaluationResult]) -> String {
    rows.iter()
        .map(|r| format!("**{}** (Score: {:.1}/10):\n{}\n", r.agent, r.score, r.reasoning))
        .collect::<Vec<_>>()
        .join("\n")
}

fn reduce_cell(
    id: u64,
    key: CellKey,
    rows: &[&AgentEvaluationResult],
    policy: DegradedPolicy,
) -> Result<EvaluationResult, PipelineError> {
    let blended = mean(rows.iter().map(|r| r.score))
        .ok_or_else(|| PipelineError::Aggregation(format!("cell {} has no rows", key)))?;

    let score = match policy {
        DegradedPolicy::Blend => blended,
        DegradedPolicy::ExcludeDegraded => {
            mean(rows.iter().filter(|r| !r.is_degraded()).map(|r| r.score)).unwrap_or(blended)
        }
    };

    Ok(EvaluationResult {
        id,
        variation_id: key.variation_id,
        test_case_id: key.test_case_id,
        criterion_id: key.criterion_id,
        score,
        response: render_response(rows),
        evaluator_model: rows
            .iter()
            .map(|r| r.agent.as_str())
            .collect::<Vec<_>>()
            .join("+"),
        degraded_agents: rows.iter().filter(|r| r.is_degraded()).count(),
    })
}

/// Collapse raw per-agent rows into one result per cell, cells in order of
/// first appearance. IDs are synthetic and start at 0.
pub fn aggregate(
    rows: &[AgentEvaluationResult],
    policy: DegradedPolicy,
) -> Result<Vec<EvaluationResult>, PipelineError> {
    let mut index: HashMap<CellKey, usize> = HashMap::new();
    let mut groups: Vec<(CellKey, Vec<&AgentEvaluationResult>)> = Vec::new();

    for row in rows {
        let key = row.key();
        match index.get(&key) {
            Some(&slot) => groups[slot].1.push(row),
            None => {
                index.insert(key, groups.len());
                groups.push((key, vec![row]));
            }
        }
    }

    let results = groups
        .iter()
        .enumerate()
        .map(|(i, (key, group))| reduce_cell(i as u64, *key, group, policy))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        raw_rows = rows.len(),
        cells = results.len(),
        policy = %policy,
        "Aggregated evaluation rows"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Outcome;

    fn row(v: u64, t: u64, c: u64, agent: &str, score: f64) -> AgentEvaluationResult {
        AgentEvaluationResult {
            variation_id: v,
            test_case_id: t,
            criterion_id: c,
            score,
            reasoning: format!("{} says so", agent),
            agent: agent.to_string(),
            outcome: Outcome::Scored,
        }
    }

    fn degraded(v: u64, t: u64, c: u64, agent: &str, score: f64) -> AgentEvaluationResult {
        AgentEvaluationResult {
            agent: format!("{} (Fallback)", agent),
            outcome: Outcome::Degraded {
                reason: "timeout".into(),
            },
            ..row(v, t, c, agent, score)
        }
    }

    #[test]
    fn test_mean_of_two_agents() {
        let rows = vec![row(1, 1, 1, "A", 6.0), row(1, 1, 1, "B", 8.0)];
        let out = aggregate(&rows, DegradedPolicy::Blend).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, 7.0);
        assert_eq!(out[0].evaluator_model, "A+B");
        assert_eq!(out[0].id, 0);
        assert_eq!(out[0].degraded_agents, 0);
    }

    #[test]
    fn test_response_format() {
        let rows = vec![row(1, 1, 1, "A", 6.0), row(1, 1, 1, "B", 7.96)];
        let out = aggregate(&rows, DegradedPolicy::Blend).unwrap();
        assert_eq!(
            out[0].response,
            "**A** (Score: 6.0/10):\nA says so\n\n**B** (Score: 8.0/10):\nB says so\n"
        );
    }

    #[test]
    fn test_groups_in_first_encounter_order() {
        let rows = vec![
            row(2, 1, 1, "A", 4.0),
            row(1, 1, 1, "A", 9.0),
            row(2, 1, 1, "B", 6.0),
        ];
        let out = aggregate(&rows, DegradedPolicy::Blend).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key(), CellKey::new(2, 1, 1));
        assert_eq!(out[0].score, 5.0);
        assert_eq!(out[1].key(), CellKey::new(1, 1, 1));
        assert_eq!(out[1].id, 1);
    }

    #[test]
    fn test_no_collision_on_digit_boundaries() {
        let rows = vec![row(1, 23, 4, "A", 2.0), row(12, 3, 4, "A", 10.0)];
        let out = aggregate(&rows, DegradedPolicy::Blend).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_blend_counts_fallback_rows() {
        let rows = vec![row(1, 1, 1, "A", 9.0), degraded(1, 1, 1, "B", 5.0)];
        let out = aggregate(&rows, DegradedPolicy::Blend).unwrap();
        assert_eq!(out[0].score, 7.0);
        assert_eq!(out[0].degraded_agents, 1);
        assert_eq!(out[0].evaluator_model, "A+B (Fallback)");
    }

    #[test]
    fn test_exclude_degraded_policy() {
        let rows = vec![row(1, 1, 1, "A", 9.0), degraded(1, 1, 1, "B", 5.0)];
        let out = aggregate(&rows, DegradedPolicy::ExcludeDegraded).unwrap();
        assert_eq!(out[0].score, 9.0);
        assert!(out[0].response.contains("B (Fallback)"));
    }

    #[test]
    fn test_exclude_degraded_all_fallback_blends() {
        let rows = vec![degraded(1, 1, 1, "A", 6.0), degraded(1, 1, 1, "B", 7.0)];
        let out = aggregate(&rows, DegradedPolicy::ExcludeDegraded).unwrap();
        assert_eq!(out[0].score, 6.5);
        assert_eq!(out[0].degraded_agents, 2);
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate(&[], DegradedPolicy::Blend).unwrap().is_empty());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("blend".parse::<DegradedPolicy>(), Ok(DegradedPolicy::Blend));
        assert_eq!(
            "EXCLUDE".parse::<DegradedPolicy>(),
            Ok(DegradedPolicy::ExcludeDegraded)
        );
        assert!("median".parse::<DegradedPolicy>().is_err());
        assert_eq!(DegradedPolicy::default(), DegradedPolicy::Blend);
    }
}
