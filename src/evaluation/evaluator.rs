use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::EvaluatorError;
use crate::model::{CriterionRef, ModelConfig, ProviderKind};
use crate::providers::{LlmClient, ProviderSettings};

pub const DEFAULT_JUDGE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_JUDGE_TEMPERATURE: f32 = 0.2;
pub const MIN_SCORE: f64 = 1.0;
pub const MAX_SCORE: f64 = 10.0;
pub const DEFAULT_SCORE: f64 = 5.0;
pub const NO_REASONING: &str = "No reasoning provided";

const JUDGE_SYSTEM_PROMPT: &str = "You are an expert evaluator of AI system prompts. Your task is to evaluate how well a system prompt \
would perform given a user input, based on a specific criterion.

You'll be provided with:
1. The system prompt that would be given to an AI assistant
2. A sample user input that would be sent to the AI assistant
3. The evaluation criterion to apply

Rate the system prompt on a scale of 1-10, where:
- 1-2: Poor/Inadequate - The prompt would perform very poorly for this criterion
- 3-4: Below Average - The prompt has significant issues for this criterion
- 5-6: Average - The prompt would perform adequately for this criterion
- 7-8: Good - The prompt would perform well for this criterion
- 9-10: Excellent - The prompt would perform exceptionally well for this criterion

Provide a score and a detailed explanation for your evaluation.
Be objective, critical, and fair in your assessment.";

#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub score: f64,
    pub reasoning: String,
}

/// A single named judge bound to one provider and model.
#[async_trait]
pub trait AgentEvaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        system_prompt: &str,
        user_input: &str,
        criterion: &CriterionRef,
    ) -> Result<Judgment, EvaluatorError>;
}

/// Clamp into `[MIN_SCORE, MAX_SCORE]`; NaN becomes the default score.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return DEFAULT_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

fn score_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)Score:\s*(-?\d+(?:\.\d+)?)").expect("valid score regex"))
}

fn reasoning_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)Reasoning:\s*(.*?)(?:\z|Score:)").expect("valid reasoning regex")
    })
}

/// Parse a `Score: <n>` / `Reasoning: <text>` reply.
pub fn parse_judgment(output: &str) -> Judgment {
    let score = score_pattern()
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(DEFAULT_SCORE);

    let reasoning = reasoning_pattern()
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| NO_REASONING.to_string());

    Judgment {
        score: clamp_score(score),
        reasoning,
    }
}

fn render_request(system_prompt: &str, user_input: &str, criterion: &CriterionRef) -> String {
    format!(
        "System Prompt to Evaluate:\n\"\"\"\n{}\n\"\"\"\n\n\
         Sample User Input:\n\"\"\"\n{}\n\"\"\"\n\n\
         Criterion: {} - {}\n\n\
         Evaluate how well the system prompt would perform for this criterion when responding to the user input.\n\n\
         Output your response in the following format exactly:\n\
         Score: [number between 1-10]\n\
         Reasoning: [your detailed explanation]",
        system_prompt, user_input, criterion.name, criterion.description
    )
}

pub struct LlmJudge {
    name: String,
    client: Arc<dyn LlmClient>,
    model: ModelConfig,
    timeout_secs: u64,
}

impl LlmJudge {
    pub fn new(name: impl Into<String>, client: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self {
            name: name.into(),
            client,
            model,
            timeout_secs: DEFAULT_JUDGE_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }
}

#[async_trait]
impl AgentEvaluator for LlmJudge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(
        &self,
        system_prompt: &str,
        user_input: &str,
        criterion: &CriterionRef,
    ) -> Result<Judgment, EvaluatorError> {
        let request = render_request(system_prompt, user_input, criterion);
        let deadline = Duration::from_secs(self.timeout_secs);
        let start = Instant::now();

        let result = tokio::time::timeout(
            deadline,
            self.client
                .complete(JUDGE_SYSTEM_PROMPT, &request, &self.model),
        )
        .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(text)) => {
                let judgment = parse_judgment(&text);
                debug!(
                    evaluator = %self.name,
                    criterion = %criterion.name,
                    score = %judgment.score,
                    elapsed_ms = %elapsed_ms,
                    "Judge responded"
                );
                Ok(judgment)
            }
            Ok(Err(e)) => Err(EvaluatorError::Provider {
                name: self.name.clone(),
                source: e,
            }),
            Err(_) => Err(EvaluatorError::Timeout {
                name: self.name.clone(),
                timeout_secs: self.timeout_secs,
            }),
        }
    }
}

/// Which judge to stand up: a display label, provider, model and sampling
/// temperature. Judges sample cooler than the prompts they grade.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorSpec {
    pub name: String,
    pub provider: ProviderKind,
    pub model: String,
    pub temperature: f32,
}

impl EvaluatorSpec {
    pub fn new(name: impl Into<String>, provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider,
            model: model.into(),
            temperature: DEFAULT_JUDGE_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// The two stock judges, OpenAI first.
    pub fn defaults() -> Vec<EvaluatorSpec> {
        vec![
            EvaluatorSpec::new("GPT-4o Evaluator", ProviderKind::OpenAi, "gpt-4o"),
            EvaluatorSpec::new(
                "Claude 3.5 Evaluator",
                ProviderKind::Anthropic,
                "claude-3-5-sonnet-20241022",
            ),
        ]
    }
}

pub fn try_build_judge(
    spec: &EvaluatorSpec,
    base: &ModelConfig,
    settings: &ProviderSettings,
    timeout_secs: u64,
) -> Result<LlmJudge, EvaluatorError> {
    if spec.model.trim().is_empty() {
        return Err(EvaluatorError::Init {
            name: spec.name.clone(),
            reason: "model name is empty".to_string(),
        });
    }

    // The run's own key only applies to the provider it was issued for.
    let explicit_key = if base.provider == spec.provider {
        base.api_key.as_deref()
    } else {
        None
    };

    let client = settings
        .client_for(spec.provider, explicit_key)
        .ok_or_else(|| EvaluatorError::Init {
            name: spec.name.clone(),
            reason: format!("no API key configured for {}", spec.provider),
        })?;

    let mut model = base.clone();
    model.provider = spec.provider;
    model.model = spec.model.clone();
    model.temperature = spec.temperature;
    model.api_key = None;

    Ok(LlmJudge::new(spec.name.clone(), client, model).with_timeout(timeout_secs))
}

/// Build every judge that can be built; failures are logged and skipped.
/// An empty return means nothing can evaluate.
pub fn build_evaluators(
    specs: &[EvaluatorSpec],
    base: &ModelConfig,
    settings: &ProviderSettings,
    timeout_secs: u64,
) -> Vec<Arc<dyn AgentEvaluator>> {
    let mut active: Vec<Arc<dyn AgentEvaluator>> = Vec::with_capacity(specs.len());
    for spec in specs {
        match try_build_judge(spec, base, settings, timeout_secs) {
            Ok(judge) => {
                info!(
                    evaluator = %spec.name,
                    provider = %spec.provider,
                    model = %spec.model,
                    "Evaluator initialized"
                );
                active.push(Arc::new(judge));
            }
            Err(e) => {
                warn!(evaluator = %spec.name, error = %e, "Dropping evaluator");
            }
        }
    }
    active
}
