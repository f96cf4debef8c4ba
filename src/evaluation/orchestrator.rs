use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::evaluator::{clamp_score, AgentEvaluator};
use super::progress::EvaluationProgress;
use crate::error::PipelineError;
use crate::metrics::Metrics;
use crate::model::{
    AgentEvaluationResult, CellKey, CriterionRef, EvaluationCriterion, Outcome, PromptVariation,
    TestCase, FALLBACK_SUFFIX,
};

pub const DEFAULT_CELL_DELAY_MS: u64 = 500;
pub const FALLBACK_SCORE_MIN: f64 = 5.0;
pub const FALLBACK_SCORE_MAX: f64 = 8.0;

fn fallback_text(criterion: &CriterionRef) -> String {
    format!(
        "Fallback evaluation for \"{}\". The system prompt appears to be well-structured \
         and addresses the key aspects described in the criterion.",
        criterion.name
    )
}

fn placeholder_score() -> f64 {
    rand::thread_rng().gen_range(FALLBACK_SCORE_MIN..FALLBACK_SCORE_MAX)
}

fn fallback_row(key: CellKey, evaluator: &str, cause: String, reasoning: String) -> AgentEvaluationResult {
    AgentEvaluationResult {
        variation_id: key.variation_id,
        test_case_id: key.test_case_id,
        criterion_id: key.criterion_id,
        score: placeholder_score(),
        reasoning,
        agent: format!("{}{}", evaluator, FALLBACK_SUFFIX),
        outcome: Outcome::Degraded { reason: cause },
    }
}

/// One row per agent, each in evaluator order.
async fn evaluate_cell(
    evaluators: &[Arc<dyn AgentEvaluator>],
    key: CellKey,
    system_prompt: &str,
    user_input: &str,
    criterion: &CriterionRef,
) -> Vec<AgentEvaluationResult> {
    let mut rows = Vec::with_capacity(evaluators.len());
    for evaluator in evaluators {
        match evaluator.evaluate(system_prompt, user_input, criterion).await {
            Ok(judgment) => rows.push(AgentEvaluationResult {
                variation_id: key.variation_id,
                test_case_id: key.test_case_id,
                criterion_id: key.criterion_id,
                score: clamp_score(judgment.score),
                reasoning: judgment.reasoning,
                agent: evaluator.name().to_string(),
                outcome: Outcome::Scored,
            }),
            Err(e) => {
                let cause = e.to_string();
                warn!(
                    cell = %key,
                    evaluator = %evaluator.name(),
                    error = %cause,
                    "Judge failed, substituting fallback score"
                );
                let reasoning = format!("{}. {}", cause, fallback_text(criterion));
                rows.push(fallback_row(key, evaluator.name(), cause, reasoning));
            }
        }
    }
    rows
}

/// Drives variations × test cases × criteria through every active judge,
/// one cell at a time.
pub struct Orchestrator {
    evaluators: Arc<[Arc<dyn AgentEvaluator>]>,
    cell_delay: Duration,
    metrics: Option<Arc<Metrics>>,
    cancel: Option<watch::Receiver<bool>>,
    label: String,
}

impl Orchestrator {
    pub fn new(evaluators: Vec<Arc<dyn AgentEvaluator>>) -> Self {
        Self {
            evaluators: evaluators.into(),
            cell_delay: Duration::from_millis(DEFAULT_CELL_DELAY_MS),
            metrics: None,
            cancel: None,
            label: "evaluation".to_string(),
        }
    }

    pub fn with_cell_delay(mut self, delay_ms: u64) -> Self {
        self.cell_delay = Duration::from_millis(delay_ms);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn evaluator_names(&self) -> Vec<String> {
        self.evaluators
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    async fn pace(&self, cancel: &mut Option<watch::Receiver<bool>>) {
        if self.cell_delay.is_zero() {
            return;
        }
        match cancel {
            Some(rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(self.cell_delay) => {}
                    Ok(()) = rx.changed() => {}
                }
            }
            None => tokio::time::sleep(self.cell_delay).await,
        }
    }

    /// Run the full matrix. Rows come back contiguous per cell, cells in
    /// variation → test case → criterion order. `on_progress` sees a
    /// non-decreasing percentage that ends at exactly 100.
    pub async fn run<F>(
        &self,
        variations: &[PromptVariation],
        test_cases: &[TestCase],
        criteria: &[EvaluationCriterion],
        mut on_progress: F,
    ) -> Result<Vec<AgentEvaluationResult>, PipelineError>
    where
        F: FnMut(f64),
    {
        if self.evaluators.is_empty() {
            error!(run = %self.label, "No evaluators available, aborting run");
            return Err(PipelineError::NoEvaluatorsAvailable);
        }

        let total = variations.len() * test_cases.len() * criteria.len();
        let mut progress = EvaluationProgress::new(self.label.clone(), total);
        progress.start();

        info!(
            run = %self.label,
            variations = variations.len(),
            test_cases = test_cases.len(),
            criteria = criteria.len(),
            evaluators = ?self.evaluator_names(),
            total_cells = total,
            "Starting evaluation matrix"
        );

        if total == 0 {
            progress.complete();
            on_progress(progress.percent());
            return Ok(Vec::new());
        }

        let names = self.evaluator_names();
        let mut cancel = self.cancel.clone();
        let mut all_rows = Vec::with_capacity(total * self.evaluators.len());

        for variation in variations {
            for test_case in test_cases {
                for criterion in criteria {
                    if self.is_cancelled() {
                        progress.cancel();
                        return Err(PipelineError::Cancelled {
                            completed_cells: progress.completed_cells(),
                        });
                    }

                    let key = CellKey::new(variation.id, test_case.id, criterion.id);

                    let evaluators = Arc::clone(&self.evaluators);
                    let system_prompt = variation.content.clone();
                    let user_input = test_case.input.clone();
                    let criterion_ref = criterion.to_ref();

                    let handle = tokio::spawn(async move {
                        evaluate_cell(
                            &evaluators,
                            key,
                            &system_prompt,
                            &user_input,
                            &criterion_ref,
                        )
                        .await
                    });

                    let rows = match handle.await {
                        Ok(rows) => rows,
                        Err(e) => {
                            error!(cell = %key, error = %e, "Cell evaluation aborted");
                            let cause = e.to_string();
                            names
                                .iter()
                                .map(|name| {
                                    fallback_row(
                                        key,
                                        name,
                                        cause.clone(),
                                        format!("Evaluation failed: {}", cause),
                                    )
                                })
                                .collect()
                        }
                    };

                    let degraded = rows.iter().filter(|r| r.is_degraded()).count();
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cell(rows.len(), degraded);
                    }
                    all_rows.extend(rows);

                    on_progress(progress.complete_cell(degraded));

                    if progress.completed_cells() < total {
                        self.pace(&mut cancel).await;
                    }
                }
            }
        }

        progress.complete();
        Ok(all_rows)
    }
}
