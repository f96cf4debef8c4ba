use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::auth::{self, AuthError};
use crate::config::Config;
use crate::error::{PipelineError, StorageError};
use crate::evaluation::evaluator::{build_evaluators, AgentEvaluator};
use crate::evaluation::pipeline::EvaluationPipeline;
use crate::generation::Generator;
use crate::metrics::Metrics;
use crate::model::{ModelConfig, ProviderKind};
use crate::providers::LlmClient;
use crate::runs::RunManager;
use crate::storage::{CriterionPatch, NewCriterion, Repository};

pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<dyn Repository>,
    pub runs: Arc<RunManager>,
    pub metrics: Arc<Metrics>,
    pub semaphore: Arc<Semaphore>,
    pub started_at: chrono::DateTime<Utc>,
    /// Judges to use for every run instead of provider-backed ones.
    pub evaluators: Option<Vec<Arc<dyn AgentEvaluator>>>,
    /// Client for the generation stage instead of one chosen per request.
    pub generation_client: Option<Arc<dyn LlmClient>>,
}

impl AppState {
    pub fn new(config: Config, repo: Arc<dyn Repository>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_runs));
        let runs = Arc::new(RunManager::new(config.run_ttl_secs));
        Self {
            config: Arc::new(config),
            repo,
            runs,
            metrics: Metrics::new(),
            semaphore,
            started_at: Utc::now(),
            evaluators: None,
            generation_client: None,
        }
    }

    pub fn with_evaluators(mut self, evaluators: Vec<Arc<dyn AgentEvaluator>>) -> Self {
        self.evaluators = Some(evaluators);
        self
    }

    pub fn with_generation_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.generation_client = Some(client);
        self
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        auth::verify_request(headers, self.config.auth_token.as_deref())?;
        Ok(())
    }

    fn generator_for(&self, model: &ModelConfig) -> Result<Generator, ApiError> {
        let client = match &self.generation_client {
            Some(client) => client.clone(),
            None => self
                .config
                .provider_settings()
                .client_for(model.provider, model.api_key.as_deref())
                .ok_or_else(|| {
                    ApiError::new(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "provider_unavailable",
                        format!("no API key configured for {}", model.provider),
                    )
                })?,
        };
        Ok(Generator::new(client).with_timeout(self.config.generation_timeout_secs))
    }

    /// Content under a meta prompt is frozen while a run evaluates it.
    fn ensure_idle(&self, meta_prompt_id: u64) -> Result<(), ApiError> {
        match self.runs.active_for(meta_prompt_id) {
            Some(run) => Err(run_active(meta_prompt_id, &run.id)),
            None => Ok(()),
        }
    }

    fn evaluators_for(&self, base: &ModelConfig) -> Vec<Arc<dyn AgentEvaluator>> {
        match &self.evaluators {
            Some(fixed) => fixed.clone(),
            None => build_evaluators(
                &self.config.pipeline_config().evaluators,
                base,
                &self.config.provider_settings(),
                self.config.judge_timeout_secs,
            ),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/meta-prompts", post(create_meta_prompt).get(list_meta_prompts))
        .route(
            "/meta-prompts/{id}",
            get(get_meta_prompt).patch(update_meta_prompt),
        )
        .route(
            "/meta-prompts/{id}/variations",
            post(generate_variations).get(list_variations),
        )
        .route(
            "/meta-prompts/{id}/test-cases",
            post(generate_test_cases).get(list_test_cases),
        )
        .route("/meta-prompts/{id}/evaluate", post(start_evaluation))
        .route("/meta-prompts/{id}/leaderboard", get(leaderboard))
        .route("/criteria", post(create_criterion).get(list_criteria))
        .route(
            "/criteria/{id}",
            patch(update_criterion).delete(delete_criterion),
        )
        .route("/variations/{id}", patch(update_variation))
        .route("/variations/{id}/results", get(variation_results))
        .route("/variations/{id}/preview", post(preview_variation))
        .route("/test-cases/{id}", patch(update_test_case))
        .route("/test-cases/{id}/results", get(test_case_results))
        .route("/results/{id}", get(get_result))
        .route("/generate", post(generate_response))
        .route("/score", post(score_response))
        .route("/test-ai-connection", post(check_ai_connection))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run).delete(cancel_run))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::new(StatusCode::UNAUTHORIZED, e.code(), e.message())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, "not_found", e.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match &e {
            PipelineError::Storage(_) => StatusCode::NOT_FOUND,
            PipelineError::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::NoEvaluatorsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.code(), e.to_string())
    }
}

fn not_found(kind: &'static str, id: u64) -> ApiError {
    StorageError::NotFound { kind, id }.into()
}

fn run_active(meta_prompt_id: u64, run_id: &str) -> ApiError {
    ApiError::new(
        StatusCode::CONFLICT,
        "run_active",
        format!(
            "run {} is still evaluating meta prompt {}",
            run_id, meta_prompt_id
        ),
    )
}

fn require_text(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: String,
    uptime_secs: i64,
    active_runs: usize,
    total_runs: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    tracked_runs: usize,
    capacity: usize,
    available_slots: usize,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
        active_runs: state.runs.active_count(),
        total_runs: state.metrics.runs_total.load(Ordering::Relaxed),
        completed: state.metrics.runs_completed.load(Ordering::Relaxed),
        failed: state.metrics.runs_failed.load(Ordering::Relaxed),
        cancelled: state.metrics.runs_cancelled.load(Ordering::Relaxed),
        tracked_runs: state.runs.len(),
        capacity: state.config.max_concurrent_runs,
        available_slots: state.semaphore.available_permits(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaPromptPayload {
    base_prompt: String,
    model_config: ModelConfig,
}

async fn create_meta_prompt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<MetaPromptPayload>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    require_text("basePrompt", &payload.base_prompt)?;

    let generator = state.generator_for(&payload.model_config)?;
    let generated = generator
        .generate_meta_prompt(&payload.base_prompt, &payload.model_config)
        .await?;

    let mut model_config = payload.model_config;
    model_config.api_key = None;
    let meta = state
        .repo
        .create_meta_prompt(payload.base_prompt, generated, model_config);
    info!(meta_prompt_id = meta.id, "Meta prompt created");
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn list_meta_prompts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.repo.list_meta_prompts())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaPromptEdit {
    generated_prompt: String,
}

async fn update_meta_prompt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(edit): Json<MetaPromptEdit>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    require_text("generatedPrompt", &edit.generated_prompt)?;
    Ok(Json(state.repo.update_meta_prompt(id, edit.generated_prompt)?))
}

async fn get_meta_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let meta = state
        .repo
        .get_meta_prompt(id)
        .ok_or_else(|| not_found("meta prompt", id))?;
    Ok(Json(meta))
}

/// Replaces any variations already stored for the meta prompt.
async fn generate_variations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let meta = state
        .repo
        .get_meta_prompt(id)
        .ok_or_else(|| not_found("meta prompt", id))?;

    state.ensure_idle(meta.id)?;

    let generator = state.generator_for(&meta.model_config)?;
    let contents = generator
        .generate_variations(&meta.generated_prompt, &meta.model_config)
        .await?;

    // A run may have started while the model was generating.
    state.ensure_idle(meta.id)?;
    for old in state.repo.variations_for_meta_prompt(meta.id) {
        state.repo.delete_variation(old.id);
    }
    let created: Vec<_> = contents
        .into_iter()
        .map(|c| {
            state
                .repo
                .create_variation(meta.id, c, meta.model_config.clone())
        })
        .collect();
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_variations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    Json(state.repo.variations_for_meta_prompt(id))
}

/// Replaces any test cases already stored for the meta prompt.
async fn generate_test_cases(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let meta = state
        .repo
        .get_meta_prompt(id)
        .ok_or_else(|| not_found("meta prompt", id))?;

    state.ensure_idle(meta.id)?;

    let generator = state.generator_for(&meta.model_config)?;
    let inputs = generator
        .generate_test_cases(&meta.generated_prompt, &meta.model_config)
        .await?;

    state.ensure_idle(meta.id)?;
    for old in state.repo.test_cases_for_meta_prompt(meta.id) {
        state.repo.delete_test_case(old.id);
    }
    let created: Vec<_> = inputs
        .into_iter()
        .map(|input| state.repo.create_test_case(meta.id, input))
        .collect();
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_test_cases(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    Json(state.repo.test_cases_for_meta_prompt(id))
}

async fn create_criterion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<NewCriterion>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    require_text("name", &payload.name)?;
    let criterion = state.repo.create_criterion(payload);
    Ok((StatusCode::CREATED, Json(criterion)))
}

async fn list_criteria(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.repo.list_criteria())
}

async fn update_criterion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(patch): Json<CriterionPatch>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    Ok(Json(state.repo.update_criterion(id, patch)?))
}

/// Also removes every stored result scored against the criterion.
async fn delete_criterion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    if !state.repo.delete_criterion(id) {
        return Err(not_found("criterion", id));
    }
    info!(criterion_id = id, "Criterion deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ContentEdit {
    content: String,
}

async fn update_variation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(edit): Json<ContentEdit>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    require_text("content", &edit.content)?;
    let variation = state
        .repo
        .get_variation(id)
        .ok_or_else(|| not_found("variation", id))?;
    state.ensure_idle(variation.meta_prompt_id)?;
    Ok(Json(state.repo.update_variation(id, edit.content)?))
}

#[derive(Deserialize)]
struct InputEdit {
    input: String,
}

async fn update_test_case(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(edit): Json<InputEdit>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    require_text("input", &edit.input)?;
    let test_case = state
        .repo
        .get_test_case(id)
        .ok_or_else(|| not_found("test case", id))?;
    state.ensure_idle(test_case.meta_prompt_id)?;
    Ok(Json(state.repo.update_test_case(id, edit.input)?))
}

async fn variation_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.repo.get_variation(id).is_none() {
        return Err(not_found("variation", id));
    }
    Ok(Json(state.repo.results_for_variation(id)))
}

async fn test_case_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.repo.get_test_case(id).is_none() {
        return Err(not_found("test case", id));
    }
    Ok(Json(state.repo.results_for_test_case(id)))
}

async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .repo
        .get_result(id)
        .ok_or_else(|| not_found("result", id))?;
    Ok(Json(result))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewRequest {
    test_case_id: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PreviewResponse {
    variation_id: u64,
    test_case_id: u64,
    response: String,
}

/// Run a stored variation against one of its test cases.
async fn preview_variation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(req): Json<PreviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let variation = state
        .repo
        .get_variation(id)
        .ok_or_else(|| not_found("variation", id))?;
    let test_case = state
        .repo
        .get_test_case(req.test_case_id)
        .ok_or_else(|| not_found("test case", req.test_case_id))?;
    if test_case.meta_prompt_id != variation.meta_prompt_id {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!(
                "test case {} does not belong to meta prompt {}",
                test_case.id, variation.meta_prompt_id
            ),
        ));
    }

    let generator = state.generator_for(&variation.model_config)?;
    let response = generator
        .preview_response(&variation.content, &test_case.input, &variation.model_config)
        .await?;
    Ok(Json(PreviewResponse {
        variation_id: variation.id,
        test_case_id: test_case.id,
        response,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_prompt: String,
    user_input: String,
    model_config: ModelConfig,
}

async fn generate_response(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    require_text("userInput", &req.user_input)?;
    let generator = state.generator_for(&req.model_config)?;
    let response = generator
        .preview_response(&req.system_prompt, &req.user_input, &req.model_config)
        .await?;
    Ok(Json(serde_json::json!({ "response": response })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoreRequest {
    response: String,
    criterion: String,
    model_config: ModelConfig,
}

async fn score_response(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ScoreRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    require_text("criterion", &req.criterion)?;
    let generator = state.generator_for(&req.model_config)?;
    let score = generator
        .score_response(&req.response, &req.criterion, &req.model_config)
        .await?;
    Ok(Json(serde_json::json!({ "score": score })))
}

#[derive(Deserialize)]
struct ConnectionRequest {
    provider: ProviderKind,
    model: Option<String>,
}

async fn check_ai_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ConnectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let model = req
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| req.provider.default_model().to_string());
    let config = ModelConfig::new(req.provider, model);
    let generator = state.generator_for(&config)?;
    let message = generator.check_connection(&config).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "provider": config.provider,
        "model": config.model,
        "message": message,
    })))
}

async fn start_evaluation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let meta = state
        .repo
        .get_meta_prompt(id)
        .ok_or_else(|| not_found("meta prompt", id))?;

    let evaluators = state.evaluators_for(&meta.model_config);
    if evaluators.is_empty() {
        return Err(PipelineError::NoEvaluatorsAvailable.into());
    }
    state.ensure_idle(meta.id)?;

    let permit = state.semaphore.clone().try_acquire_owned().map_err(|_| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "at_capacity",
            format!(
                "At capacity ({} concurrent runs). Try again later.",
                state.config.max_concurrent_runs
            ),
        )
    })?;

    let run = state
        .runs
        .try_create(meta.id)
        .map_err(|active| run_active(meta.id, &active.id))?;
    let run_id = run.id.clone();
    let pipeline = EvaluationPipeline::new(
        state.repo.clone(),
        state.config.provider_settings(),
        state.config.pipeline_config(),
    )
    .with_metrics(state.metrics.clone())
    .with_evaluators(evaluators);

    info!(run_id = %run_id, meta_prompt_id = meta.id, "Evaluation run accepted");

    tokio::spawn(async move {
        let _permit = permit;
        run.mark_running();
        let cancel = run.cancel_receiver();
        let progress_run = run.clone();
        match pipeline
            .run(meta.id, Some(cancel), move |pct| progress_run.set_progress(pct))
            .await
        {
            Ok(summary) => run.complete(summary),
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Evaluation run ended early");
                run.fail(&e);
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "runId": run_id })),
    ))
}

async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.repo.get_meta_prompt(id).is_none() {
        return Err(not_found("meta prompt", id));
    }
    Ok(Json(state.repo.get_leaderboard(id)))
}

async fn list_runs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.runs.list())
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .runs
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("run {} not found", id)))?;
    Ok(Json(run.snapshot()))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let run = state
        .runs
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("run {} not found", id)))?;
    if !run.request_cancel() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "already_finished",
            format!("run {} has already finished", id),
        ));
    }
    info!(run_id = %id, "Cancellation requested");
    Ok((StatusCode::ACCEPTED, Json(run.snapshot())))
}
