use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};

use super::aggregator::{aggregate, DegradedPolicy};
use super::evaluator::{build_evaluators, AgentEvaluator, EvaluatorSpec, DEFAULT_JUDGE_TIMEOUT_SECS};
use super::orchestrator::{Orchestrator, DEFAULT_CELL_DELAY_MS};
use crate::error::{PipelineError, StorageError};
use crate::metrics::{Metrics, RunOutcome};
use crate::providers::ProviderSettings;
use crate::storage::Repository;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub evaluators: Vec<EvaluatorSpec>,
    pub judge_timeout_secs: u64,
    pub cell_delay_ms: u64,
    pub policy: DegradedPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            evaluators: EvaluatorSpec::defaults(),
            judge_timeout_secs: DEFAULT_JUDGE_TIMEOUT_SECS,
            cell_delay_ms: DEFAULT_CELL_DELAY_MS,
            policy: DegradedPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_judge_timeout(mut self, timeout_secs: u64) -> Self {
        self.judge_timeout_secs = timeout_secs;
        self
    }

    pub fn with_cell_delay(mut self, delay_ms: u64) -> Self {
        self.cell_delay_ms = delay_ms;
        self
    }

    /// Sampling temperature for every configured judge.
    pub fn with_judge_temperature(mut self, temperature: f32) -> Self {
        for spec in &mut self.evaluators {
            spec.temperature = temperature;
        }
        self
    }

    pub fn with_policy(mut self, policy: DegradedPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// What one completed run produced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub meta_prompt_id: u64,
    pub evaluators: Vec<String>,
    pub variations: usize,
    pub test_cases: usize,
    pub criteria: usize,
    pub raw_rows: usize,
    pub degraded_rows: usize,
    pub results: usize,
    /// Results skipped because their variation, test case or criterion was
    /// deleted while the run was in flight.
    pub dropped_results: usize,
    pub duration_ms: u64,
}

/// Repository-backed run: load → orchestrate → aggregate → persist.
pub struct EvaluationPipeline {
    repo: Arc<dyn Repository>,
    settings: ProviderSettings,
    config: PipelineConfig,
    metrics: Option<Arc<Metrics>>,
    fixed_evaluators: Option<Vec<Arc<dyn AgentEvaluator>>>,
}

impl EvaluationPipeline {
    pub fn new(repo: Arc<dyn Repository>, settings: ProviderSettings, config: PipelineConfig) -> Self {
        Self {
            repo,
            settings,
            config,
            metrics: None,
            fixed_evaluators: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Skip provider-backed construction and judge with these instead.
    pub fn with_evaluators(mut self, evaluators: Vec<Arc<dyn AgentEvaluator>>) -> Self {
        self.fixed_evaluators = Some(evaluators);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run<F>(
        &self,
        meta_prompt_id: u64,
        cancel: Option<watch::Receiver<bool>>,
        on_progress: F,
    ) -> Result<RunSummary, PipelineError>
    where
        F: FnMut(f64),
    {
        let start = Instant::now();
        if let Some(m) = &self.metrics {
            m.start_run();
        }

        let result = self.execute(meta_prompt_id, cancel, on_progress, start).await;

        if let Some(m) = &self.metrics {
            let outcome = match &result {
                Ok(_) => RunOutcome::Completed,
                Err(PipelineError::Cancelled { .. }) => RunOutcome::Cancelled,
                Err(_) => RunOutcome::Failed,
            };
            m.finish_run(outcome, start.elapsed().as_millis() as u64);
        }
        result
    }

    async fn execute<F>(
        &self,
        meta_prompt_id: u64,
        cancel: Option<watch::Receiver<bool>>,
        on_progress: F,
        start: Instant,
    ) -> Result<RunSummary, PipelineError>
    where
        F: FnMut(f64),
    {
        let meta = self
            .repo
            .get_meta_prompt(meta_prompt_id)
            .ok_or(StorageError::NotFound {
                kind: "meta prompt",
                id: meta_prompt_id,
            })?;

        let variations = self.repo.variations_for_meta_prompt(meta.id);
        let test_cases = self.repo.test_cases_for_meta_prompt(meta.id);
        let criteria = self.repo.list_criteria();

        let evaluators = match &self.fixed_evaluators {
            Some(fixed) => fixed.clone(),
            None => build_evaluators(
                &self.config.evaluators,
                &meta.model_config,
                &self.settings,
                self.config.judge_timeout_secs,
            ),
        };

        let mut orchestrator = Orchestrator::new(evaluators)
            .with_cell_delay(self.config.cell_delay_ms)
            .with_label(format!("meta-prompt-{}", meta.id));
        if let Some(m) = &self.metrics {
            orchestrator = orchestrator.with_metrics(Arc::clone(m));
        }
        if let Some(rx) = cancel {
            orchestrator = orchestrator.with_cancel(rx);
        }

        let raw = orchestrator
            .run(&variations, &test_cases, &criteria, on_progress)
            .await?;
        let degraded_rows = raw.iter().filter(|r| r.is_degraded()).count();
        let aggregated = aggregate(&raw, self.config.policy)?;

        let produced = aggregated.len();
        let variation_ids: Vec<u64> = variations.iter().map(|v| v.id).collect();
        let stored = self.repo.replace_results(&variation_ids, aggregated);
        if stored < produced {
            warn!(
                meta_prompt_id = meta.id,
                dropped = produced - stored,
                "Skipped results for entities deleted during the run"
            );
        }

        if degraded_rows > 0 {
            warn!(
                meta_prompt_id = meta.id,
                degraded_rows,
                raw_rows = raw.len(),
                "Run completed with fallback scores"
            );
        }

        let summary = RunSummary {
            meta_prompt_id: meta.id,
            evaluators: orchestrator.evaluator_names(),
            variations: variations.len(),
            test_cases: test_cases.len(),
            criteria: criteria.len(),
            raw_rows: raw.len(),
            degraded_rows,
            results: stored,
            dropped_results: produced - stored,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            meta_prompt_id = meta.id,
            results = summary.results,
            duration_ms = summary.duration_ms,
            "Evaluation run persisted"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::super::evaluator::mock::{Behavior, MockEvaluator};
    use super::*;
    use crate::model::{ModelConfig, ProviderKind};
    use crate::storage::{MemRepository, NewCriterion};
    use std::sync::atomic::Ordering;

    fn seeded_repo(variations: usize, test_cases: usize) -> (Arc<MemRepository>, u64) {
        let repo = Arc::new(MemRepository::new());
        let cfg = ModelConfig::for_provider(ProviderKind::OpenAi);
        let meta = repo.create_meta_prompt("base".into(), "generated".into(), cfg.clone());
        for i in 0..variations {
            repo.create_variation(meta.id, format!("variation {}", i), cfg.clone());
        }
        for i in 0..test_cases {
            repo.create_test_case(meta.id, format!("input {}", i));
        }
        repo.create_criterion(NewCriterion {
            name: "Clarity".into(),
            description: "Is it clear".into(),
            weight: 1.0,
            model_config: ModelConfig::for_provider(ProviderKind::Anthropic),
        });
        (repo, meta.id)
    }

    fn pipeline(repo: Arc<MemRepository>, evaluators: Vec<Arc<dyn AgentEvaluator>>) -> EvaluationPipeline {
        EvaluationPipeline::new(
            repo,
            ProviderSettings::default(),
            PipelineConfig::default().with_cell_delay(0),
        )
        .with_evaluators(evaluators)
    }

    #[tokio::test]
    async fn test_run_persists_aggregated_results() {
        let (repo, meta_id) = seeded_repo(2, 2);
        let p = pipeline(
            repo.clone(),
            vec![MockEvaluator::scoring("A", 6.0), MockEvaluator::scoring("B", 8.0)],
        );

        let mut last = 0.0;
        let summary = p.run(meta_id, None, |pct| last = pct).await.unwrap();

        assert_eq!(last, 100.0);
        assert_eq!(summary.raw_rows, 8);
        assert_eq!(summary.results, 4);
        assert_eq!(summary.evaluators, vec!["A", "B"]);

        let stored = repo.results_for_variation(1);
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.score == 7.0 && r.evaluator_model == "A+B"));

        let board = repo.get_leaderboard(meta_id);
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].scores["Clarity"], 7.0);
    }

    #[tokio::test]
    async fn test_rerun_replaces_previous_results() {
        let (repo, meta_id) = seeded_repo(1, 2);
        let p = pipeline(repo.clone(), vec![MockEvaluator::scoring("A", 5.0)]);
        p.run(meta_id, None, |_| {}).await.unwrap();
        p.run(meta_id, None, |_| {}).await.unwrap();

        let stored = repo.results_for_variation(1);
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.id > 2));
    }

    #[tokio::test]
    async fn test_variation_deleted_mid_run_leaves_no_results() {
        let (repo, meta_id) = seeded_repo(2, 1);
        let p = pipeline(repo.clone(), vec![MockEvaluator::with("Slow", Behavior::Slow(100))]);

        let delete = async {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            assert!(repo.delete_variation(1));
        };
        let (summary, ()) = tokio::join!(p.run(meta_id, None, |_| {}), delete);
        let summary = summary.unwrap();

        assert_eq!(summary.variations, 2);
        assert_eq!(summary.results, 1);
        assert_eq!(summary.dropped_results, 1);
        assert!(repo.results_for_variation(1).is_empty());
        assert_eq!(repo.results_for_variation(2).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_meta_prompt() {
        let repo = Arc::new(MemRepository::new());
        let p = pipeline(repo, vec![MockEvaluator::scoring("A", 5.0)]);
        let err = p.run(7, None, |_| {}).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_no_evaluators_stores_nothing() {
        let (repo, meta_id) = seeded_repo(1, 1);
        let metrics = Metrics::new();
        let p = EvaluationPipeline::new(
            repo.clone(),
            ProviderSettings::default(),
            PipelineConfig::default().with_cell_delay(0),
        )
        .with_metrics(metrics.clone());

        let err = p.run(meta_id, None, |_| {}).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoEvaluatorsAvailable));
        assert!(repo.results_for_variation(1).is_empty());
        assert_eq!(metrics.runs_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.runs_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_exclude_policy_applies() {
        let (repo, meta_id) = seeded_repo(1, 1);
        let p = EvaluationPipeline::new(
            repo.clone(),
            ProviderSettings::default(),
            PipelineConfig::default()
                .with_cell_delay(0)
                .with_policy(DegradedPolicy::ExcludeDegraded),
        )
        .with_evaluators(vec![
            MockEvaluator::scoring("A", 9.0),
            MockEvaluator::failing("B"),
        ]);

        let summary = p.run(meta_id, None, |_| {}).await.unwrap();
        assert_eq!(summary.degraded_rows, 1);
        let stored = repo.results_for_variation(1);
        assert_eq!(stored[0].score, 9.0);
        assert_eq!(stored[0].degraded_agents, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_old_results() {
        let (repo, meta_id) = seeded_repo(1, 1);
        let p = pipeline(repo.clone(), vec![MockEvaluator::scoring("A", 4.0)]);
        p.run(meta_id, None, |_| {}).await.unwrap();

        let (tx, rx) = watch::channel(true);
        let err = p.run(meta_id, Some(rx), |_| {}).await.unwrap_err();
        drop(tx);
        assert!(matches!(err, PipelineError::Cancelled { .. }));
        assert_eq!(repo.results_for_variation(1).len(), 1);
    }
}
