//! Text-generation stage: base prompt → meta prompt → variations / test cases,
//! plus the one-shot helpers behind response previews and single-response
//! scoring.
//!
//! Only the output contracts matter to the rest of the service; the prompts
//! themselves are tuning knobs.

use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ParseError, PipelineError, ProviderError};
use crate::model::{ModelConfig, ProviderKind};
use crate::providers::LlmClient;

pub const MIN_META_PROMPT_LEN: usize = 50;
pub const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 120;
pub const VARIATION_DELIMITER: &str = "---";
pub const TEST_CASE_PREFIX: &str = "Test case:";
const VARIATION_MAX_TOKENS: u32 = 4000;
const CONNECTION_CHECK_MAX_TOKENS: u32 = 100;
pub const MIN_RESPONSE_SCORE: f64 = 0.0;
pub const MAX_RESPONSE_SCORE: f64 = 10.0;

const META_PROMPT_INSTRUCTIONS: &str = "You are a senior prompt engineer. Rewrite the user's short \
instruction into a complete system prompt for an AI assistant.

The system prompt you write should:
- state the assistant's role and area of expertise
- describe the expected tone, depth and structure of answers
- list the constraints and things the assistant must avoid
- explain how to handle ambiguous or out-of-scope requests

Reply with the system prompt only, without preamble or commentary.";

const VARIATION_INSTRUCTIONS: &str = "You are a senior prompt engineer. Produce 3 distinct variations \
of the system prompt you are given. Each variation keeps the original purpose but takes a different \
angle, for example a stricter structure, a more conversational voice, or an emphasis on step-by-step \
reasoning.

Every variation must be a complete, ready-to-use system prompt.
Separate variations with a line that contains only \"---\".
Do not add headings, numbering or commentary outside the variations.";

const TEST_CASE_INSTRUCTIONS: &str = "You design evaluation inputs for AI assistants. Given a system \
prompt, write 5 realistic user messages that exercise it: typical requests, edge cases, requests that \
stress its constraints, and at least one ambiguous request.

Format rules:
- put each test case on its own line
- start every line with \"Test case: \" followed by the exact user message
- output nothing else";

const SCORING_INSTRUCTIONS: &str = "You grade AI responses. Judge how well the response you are given \
satisfies the stated criterion and give it a score from 0 to 10 in steps of 0.5.

Use these bands:
- 0-2: fails to address the criterion
- 3-4: addresses it partially with serious problems
- 5-6: adequate with some problems
- 7-8: effective with minor problems
- 9-10: outstanding

Reply with the number only.";

const CONNECTION_CHECK_SYSTEM: &str = "You are a helpful AI assistant.";

/// A meta prompt is usable when it is long enough and actually differs from
/// the base prompt.
pub fn validate_meta_prompt(base_prompt: &str, generated: &str) -> Result<(), ParseError> {
    let len = generated.chars().count();
    if len < MIN_META_PROMPT_LEN {
        return Err(ParseError::MetaPromptTooShort {
            len,
            min: MIN_META_PROMPT_LEN,
        });
    }
    if generated == base_prompt {
        return Err(ParseError::MetaPromptUnchanged);
    }
    Ok(())
}

/// Split on lines consisting of `---`, dropping empty pieces.
pub fn parse_variations(raw: &str) -> Result<Vec<String>, ParseError> {
    let mut pieces = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.trim() == VARIATION_DELIMITER {
            pieces.push(current.join("\n"));
            current.clear();
        } else {
            current.push(line);
        }
    }
    pieces.push(current.join("\n"));

    let variations: Vec<String> = pieces
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    if variations.is_empty() {
        return Err(ParseError::NoVariations);
    }
    Ok(variations)
}

/// Keep `Test case:` lines, prefix stripped.
pub fn parse_test_cases(raw: &str) -> Result<Vec<String>, ParseError> {
    let cases: Vec<String> = raw
        .lines()
        .filter_map(|line| line.trim().strip_prefix(TEST_CASE_PREFIX))
        .map(|rest| rest.trim().to_string())
        .collect();

    if cases.is_empty() {
        return Err(ParseError::NoTestCases);
    }
    Ok(cases)
}

fn leading_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(-?\d+(?:\.\d+)?)").expect("valid number regex"))
}

/// Read the number a scoring reply starts with, clamped to `[0, 10]`.
pub fn parse_response_score(raw: &str) -> Result<f64, ParseError> {
    leading_number()
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|score| score.clamp(MIN_RESPONSE_SCORE, MAX_RESPONSE_SCORE))
        .ok_or(ParseError::NoScore)
}

fn render_scoring_request(response: &str, criterion: &str) -> String {
    format!(
        "Criterion: \"{}\"\n\nResponse to evaluate:\n{}",
        criterion, response
    )
}

fn provider_title(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::OpenAi => "OpenAI",
        ProviderKind::Anthropic => "Anthropic",
    }
}

/// Variations want more spread than the base config.
fn variation_config(base: &ModelConfig) -> ModelConfig {
    let mut config = base.clone();
    config.temperature = (base.temperature * 1.5).min(1.0);
    config.max_tokens = base.max_tokens.max(VARIATION_MAX_TOKENS);
    config
}

pub struct Generator {
    client: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl Generator {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(DEFAULT_GENERATION_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_secs);
        self
    }

    async fn complete(
        &self,
        system: &str,
        user: &str,
        config: &ModelConfig,
    ) -> Result<String, PipelineError> {
        let text = tokio::time::timeout(self.timeout, self.client.complete(system, user, config))
            .await
            .map_err(|_| ProviderError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            })??;
        Ok(text)
    }

    pub async fn generate_meta_prompt(
        &self,
        base_prompt: &str,
        config: &ModelConfig,
    ) -> Result<String, PipelineError> {
        info!(provider = %config.provider, model = %config.model, "Generating meta prompt");
        let generated = self
            .complete(META_PROMPT_INSTRUCTIONS, base_prompt, config)
            .await?;
        let generated = generated.trim().to_string();
        validate_meta_prompt(base_prompt, &generated)?;
        debug!(len = generated.len(), "Meta prompt accepted");
        Ok(generated)
    }

    pub async fn generate_variations(
        &self,
        meta_prompt: &str,
        config: &ModelConfig,
    ) -> Result<Vec<String>, PipelineError> {
        let config = variation_config(config);
        info!(temperature = %config.temperature, "Generating prompt variations");
        let raw = self
            .complete(VARIATION_INSTRUCTIONS, meta_prompt, &config)
            .await?;
        let variations = parse_variations(&raw)?;
        debug!(count = variations.len(), "Parsed variations");
        Ok(variations)
    }

    pub async fn generate_test_cases(
        &self,
        meta_prompt: &str,
        config: &ModelConfig,
    ) -> Result<Vec<String>, PipelineError> {
        info!("Generating test cases");
        let raw = self
            .complete(TEST_CASE_INSTRUCTIONS, meta_prompt, config)
            .await?;
        let cases = parse_test_cases(&raw)?;
        debug!(count = cases.len(), "Parsed test cases");
        Ok(cases)
    }

    /// What a model answers to `user_input` under `system_prompt`.
    pub async fn preview_response(
        &self,
        system_prompt: &str,
        user_input: &str,
        config: &ModelConfig,
    ) -> Result<String, PipelineError> {
        info!(provider = %config.provider, model = %config.model, "Generating response preview");
        self.complete(system_prompt, user_input, config).await
    }

    /// Score one response against one criterion on a 0-10 scale.
    pub async fn score_response(
        &self,
        response: &str,
        criterion: &str,
        config: &ModelConfig,
    ) -> Result<f64, PipelineError> {
        let request = render_scoring_request(response, criterion);
        let raw = self
            .complete(SCORING_INSTRUCTIONS, &request, config)
            .await?;
        let score = parse_response_score(&raw)?;
        debug!(criterion, score, "Scored response");
        Ok(score)
    }

    /// Send a tiny request and return the reply, failing on an empty one.
    pub async fn check_connection(&self, config: &ModelConfig) -> Result<String, PipelineError> {
        let mut config = config.clone();
        config.max_tokens = CONNECTION_CHECK_MAX_TOKENS;
        let request = format!(
            "Please respond with the text '{} connection successful!' and today's date.",
            provider_title(config.provider)
        );
        let reply = self
            .complete(CONNECTION_CHECK_SYSTEM, &request, &config)
            .await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ProviderError::EmptyResponse {
                provider: config.provider,
            }
            .into());
        }
        info!(provider = %config.provider, model = %config.model, "Provider connection ok");
        Ok(reply.to_string())
    }
}
