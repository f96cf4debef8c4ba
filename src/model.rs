use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Suffix appended to an evaluator label when its row is a placeholder.
pub const FALLBACK_SUFFIX: &str = " (Fallback)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o",
            ProviderKind::Anthropic => "claude-3-5-sonnet-20241022",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            other => Err(format!("unsupported provider: {}", other)),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_top_p() -> f32 {
    1.0
}

impl ModelConfig {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            api_key: None,
        }
    }

    pub fn for_provider(provider: ProviderKind) -> Self {
        Self::new(provider, provider.default_model())
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

// Keys must never reach the logs.
impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("top_p", &self.top_p)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetaPrompt {
    pub id: u64,
    pub base_prompt: String,
    pub generated_prompt: String,
    pub model_config: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptVariation {
    pub id: u64,
    pub meta_prompt_id: u64,
    pub content: String,
    pub model_config: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: u64,
    pub meta_prompt_id: u64,
    pub input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationCriterion {
    pub id: u64,
    pub name: String,
    pub description: String,
    /// Advisory only; aggregation and ranking never apply it.
    pub weight: f64,
    pub model_config: ModelConfig,
}

impl EvaluationCriterion {
    pub fn to_ref(&self) -> CriterionRef {
        CriterionRef {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            weight: self.weight,
        }
    }
}

/// The slice of a criterion a judge actually sees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionRef {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub weight: f64,
}

/// Identity of one (variation, test case, criterion) evaluation cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub variation_id: u64,
    pub test_case_id: u64,
    pub criterion_id: u64,
}

impl CellKey {
    pub fn new(variation_id: u64, test_case_id: u64, criterion_id: u64) -> Self {
        Self {
            variation_id,
            test_case_id,
            criterion_id,
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{}/t{}/c{}",
            self.variation_id, self.test_case_id, self.criterion_id
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Scored,
    Degraded { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvaluationResult {
    pub variation_id: u64,
    pub test_case_id: u64,
    pub criterion_id: u64,
    pub score: f64,
    pub reasoning: String,
    pub agent: String,
    pub outcome: Outcome,
}

impl AgentEvaluationResult {
    pub fn key(&self) -> CellKey {
        CellKey::new(self.variation_id, self.test_case_id, self.criterion_id)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, Outcome::Degraded { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub id: u64,
    pub variation_id: u64,
    pub test_case_id: u64,
    pub criterion_id: u64,
    pub score: f64,
    pub response: String,
    pub evaluator_model: String,
    #[serde(default)]
    pub degraded_agents: usize,
}

impl EvaluationResult {
    pub fn key(&self) -> CellKey {
        CellKey::new(self.variation_id, self.test_case_id, self.criterion_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BestModelPair {
    pub provider: ProviderKind,
    pub model: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub variation_id: u64,
    pub content: String,
    /// NaN until at least one criterion has been scored.
    pub average_score: f64,
    pub scores: BTreeMap<String, f64>,
    pub best_model_pair: BestModelPair,
}

impl LeaderboardEntry {
    pub fn is_evaluated(&self) -> bool {
        !self.average_score.is_nan()
    }
}
