//! Error types shared across the evaluation service.
//!
//! Evaluator and provider failures are recoverable at the cell level and never
//! escape the orchestrator; everything reaching `PipelineError` stops a run.

use crate::model::ProviderKind;

/// Failures from a concrete LLM provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed for provider {provider}")]
    Auth { provider: ProviderKind },

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: ProviderKind,
        status: u16,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} returned an empty response")]
    EmptyResponse { provider: ProviderKind },

    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

/// Failures of one judge, either building it or invoking it.
#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("failed to initialize {name}: {reason}")]
    Init { name: String, reason: String },

    #[error("{name} timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("{name} invocation failed: {source}")]
    Provider {
        name: String,
        #[source]
        source: ProviderError,
    },
}

/// Generation-stage output that cannot be used.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("failed to parse variations from model response")]
    NoVariations,

    #[error("failed to parse test cases from model response")]
    NoTestCases,

    #[error("generated meta prompt is too short ({len} chars, min {min})")]
    MetaPromptTooShort { len: usize, min: usize },

    #[error("generated meta prompt is identical to the base prompt")]
    MetaPromptUnchanged,

    #[error("failed to parse a score from model response")]
    NoScore,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no evaluators available")]
    NoEvaluatorsAvailable,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("generation failed: {0}")]
    Generation(#[from] ProviderError),

    #[error("aggregation invariant violated: {0}")]
    Aggregation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("evaluation cancelled after {completed_cells} cells")]
    Cancelled { completed_cells: usize },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::NoEvaluatorsAvailable => "no_evaluators",
            PipelineError::Parse(_) => "parse_error",
            PipelineError::Generation(_) => "generation_failed",
            PipelineError::Aggregation(_) => "aggregation_error",
            PipelineError::Storage(StorageError::NotFound { .. }) => "not_found",
            PipelineError::Cancelled { .. } => "cancelled",
        }
    }
}
