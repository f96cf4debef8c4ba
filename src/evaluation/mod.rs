pub mod aggregator;
pub mod evaluator;
pub mod leaderboard;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;

pub use aggregator::{aggregate, DegradedPolicy};
pub use evaluator::{AgentEvaluator, EvaluatorSpec, LlmJudge};
pub use leaderboard::build_leaderboard;
pub use orchestrator::Orchestrator;
pub use pipeline::{EvaluationPipeline, PipelineConfig, RunSummary};
pub use progress::{EvaluationProgress, RunStatus};
