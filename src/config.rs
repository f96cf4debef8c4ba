use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::evaluation::aggregator::DegradedPolicy;
use crate::evaluation::evaluator::{DEFAULT_JUDGE_TEMPERATURE, DEFAULT_JUDGE_TIMEOUT_SECS};
use crate::evaluation::orchestrator::DEFAULT_CELL_DELAY_MS;
use crate::evaluation::pipeline::PipelineConfig;
use crate::generation::DEFAULT_GENERATION_TIMEOUT_SECS;
use crate::model::{ModelConfig, ProviderKind};
use crate::providers::ProviderSettings;
use crate::storage::NewCriterion;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_RUN_TTL: u64 = 3600;
const DEFAULT_MAX_CONCURRENT: usize = 2;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub auth_token: Option<String>,
    pub run_ttl_secs: u64,
    pub max_concurrent_runs: usize,
    pub judge_timeout_secs: u64,
    pub judge_temperature: f32,
    pub cell_delay_ms: u64,
    pub generation_timeout_secs: u64,
    pub degraded_policy: DegradedPolicy,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub criteria_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            port: env_parse(&lookup, "PORT", DEFAULT_PORT),
            auth_token: text("AUTH_TOKEN"),
            run_ttl_secs: env_parse(&lookup, "RUN_TTL_SECS", DEFAULT_RUN_TTL),
            max_concurrent_runs: env_parse(&lookup, "MAX_CONCURRENT_RUNS", DEFAULT_MAX_CONCURRENT)
                .max(1),
            judge_timeout_secs: env_parse(&lookup, "JUDGE_TIMEOUT_SECS", DEFAULT_JUDGE_TIMEOUT_SECS),
            judge_temperature: env_parse(&lookup, "JUDGE_TEMPERATURE", DEFAULT_JUDGE_TEMPERATURE)
                .clamp(0.0, 2.0),
            cell_delay_ms: env_parse(&lookup, "CELL_DELAY_MS", DEFAULT_CELL_DELAY_MS),
            generation_timeout_secs: env_parse(
                &lookup,
                "GENERATION_TIMEOUT_SECS",
                DEFAULT_GENERATION_TIMEOUT_SECS,
            ),
            degraded_policy: env_parse(&lookup, "DEGRADED_POLICY", DegradedPolicy::Blend),
            openai_api_key: text("OPENAI_API_KEY"),
            anthropic_api_key: text("ANTHROPIC_API_KEY"),
            openai_base_url: text("OPENAI_BASE_URL"),
            anthropic_base_url: text("ANTHROPIC_BASE_URL"),
            criteria_file: text("CRITERIA_FILE").map(PathBuf::from),
        }
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            openai_api_key: self.openai_api_key.clone(),
            openai_base_url: self.openai_base_url.clone(),
            anthropic_api_key: self.anthropic_api_key.clone(),
            anthropic_base_url: self.anthropic_base_url.clone(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_judge_timeout(self.judge_timeout_secs)
            .with_judge_temperature(self.judge_temperature)
            .with_cell_delay(self.cell_delay_ms)
            .with_policy(self.degraded_policy)
    }

    pub fn print_banner(&self) {
        let key_state = |k: &Option<String>| if k.is_some() { "configured" } else { "missing" };
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║              prompt-arena v{:<22}║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Port:              {:<28}║", self.port);
        tracing::info!("║  Auth:              {:<28}║", if self.auth_token.is_some() { "enabled" } else { "disabled" });
        tracing::info!("║  Max concurrent:    {:<28}║", self.max_concurrent_runs);
        tracing::info!("║  Run TTL:           {:<27}s║", self.run_ttl_secs);
        tracing::info!("║  Judge timeout:     {:<27}s║", self.judge_timeout_secs);
        tracing::info!("║  Judge temperature: {:<28}║", self.judge_temperature);
        tracing::info!("║  Cell delay:        {:<26}ms║", self.cell_delay_ms);
        tracing::info!("║  Degraded policy:   {:<28}║", self.degraded_policy);
        tracing::info!("║  OpenAI key:        {:<28}║", key_state(&self.openai_api_key));
        tracing::info!("║  Anthropic key:     {:<28}║", key_state(&self.anthropic_api_key));
        tracing::info!("╚══════════════════════════════════════════════════╝");

        if let Some(path) = &self.criteria_file {
            tracing::info!("Criteria seed file: {}", path.display());
        }
    }
}

// Secrets stay out of debug output.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("auth", &self.auth_token.is_some())
            .field("run_ttl_secs", &self.run_ttl_secs)
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .field("judge_timeout_secs", &self.judge_timeout_secs)
            .field("judge_temperature", &self.judge_temperature)
            .field("cell_delay_ms", &self.cell_delay_ms)
            .field("degraded_policy", &self.degraded_policy)
            .field("criteria_file", &self.criteria_file)
            .finish_non_exhaustive()
    }
}

/// Unset or blank keys take the default silently; unparsable ones warn.
fn env_parse<T: std::str::FromStr + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, default = %default, "Ignoring invalid setting");
            default
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CriterionSeed {
    name: String,
    description: String,
    #[serde(default = "default_weight")]
    weight: f64,
    model_config: Option<ModelConfig>,
}

fn default_weight() -> f64 {
    1.0
}

/// Read the YAML list of criteria to create at startup.
pub fn load_criteria_seed(path: &Path) -> anyhow::Result<Vec<NewCriterion>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read criteria file {}", path.display()))?;
    let seeds: Vec<CriterionSeed> = serde_yaml::from_str(&raw)
        .with_context(|| format!("Invalid criteria file {}", path.display()))?;

    Ok(seeds
        .into_iter()
        .map(|s| NewCriterion {
            name: s.name,
            description: s.description,
            weight: s.weight,
            model_config: s
                .model_config
                .unwrap_or_else(|| ModelConfig::for_provider(ProviderKind::OpenAi)),
        })
        .collect())
}
