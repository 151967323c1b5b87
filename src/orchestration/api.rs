use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::coordinator::Coordinator;
use super::db::DbHandle;
use super::stages::review::ReviewRequest;
use crate::errors::OrchestrationError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub coordinator: Coordinator,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            db: coordinator.context().db.clone(),
            coordinator,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    pub goal: String,
    pub target_term: Option<String>,
}

#[derive(Deserialize)]
pub struct AddDocumentRequest {
    pub title: String,
    pub content: String,
    pub publication_year: Option<i32>,
}

#[derive(Deserialize)]
pub struct StartAnalysisRequest {
    #[serde(default = "default_review_choices")]
    pub review_choices: bool,
}

fn default_review_choices() -> bool {
    true
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        let message = err.to_string();
        match err {
            OrchestrationError::RunNotFound { .. } | OrchestrationError::ExperimentNotFound { .. } => {
                ApiError::NotFound(message)
            }
            OrchestrationError::Input(_)
            | OrchestrationError::InvalidStrategy(_)
            | OrchestrationError::SchemaValidation { .. } => ApiError::BadRequest(message),
            OrchestrationError::ReviewConflict { .. }
            | OrchestrationError::ResumeConflict { .. }
            | OrchestrationError::StageConflict { .. } => ApiError::Conflict(message),
            _ => {
                tracing::error!("request failed: {}", message);
                ApiError::Internal(message)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/experiments", post(create_experiment))
        .route("/api/experiments/{id}", get(get_experiment))
        .route("/api/experiments/{id}/documents", post(add_document))
        .route("/api/experiments/{id}/runs", get(list_experiment_runs))
        .route("/api/experiments/{id}/provenance", get(experiment_provenance))
        .route(
            "/api/orchestration/start-analysis/{experiment_id}",
            post(start_analysis),
        )
        .route("/api/orchestration/status/{run_id}", get(run_status))
        .route(
            "/api/orchestration/approve-strategy/{run_id}",
            post(approve_strategy),
        )
        .route("/api/orchestration/resume/{run_id}", post(resume_run))
        .route(
            "/api/orchestration/runs/{run_id}/provenance",
            get(run_provenance),
        )
        .route(
            "/api/orchestration/runs/{run_id}/invocations",
            get(run_invocations),
        )
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_experiment(
    State(state): State<SharedState>,
    Json(req): Json<CreateExperimentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() || req.goal.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Experiment name and goal are required".to_string(),
        ));
    }
    let experiment = state
        .db
        .call(move |db| db.create_experiment(&req.name, &req.goal, req.target_term.as_deref()))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    tracing::info!(experiment_id = experiment.id, "experiment created");
    Ok((StatusCode::CREATED, Json(experiment)))
}

async fn get_experiment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state
        .coordinator
        .context()
        .documents
        .load_experiment(id)
        .await?;
    Ok(Json(bundle))
}

async fn add_document(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<AddDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("Document title is required".to_string()));
    }
    let document = state
        .db
        .call(move |db| db.add_document(id, &req.title, &req.content, req.publication_year))
        .await
        .map_err(OrchestrationError::from_db)?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn list_experiment_runs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state
        .coordinator
        .context()
        .db(move |db| {
            if db.get_experiment(id)?.is_none() {
                return Err(OrchestrationError::ExperimentNotFound { id }.into());
            }
            db.list_runs_for_experiment(id)
        })
        .await?;
    Ok(Json(runs))
}

async fn experiment_provenance(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state.coordinator.experiment_provenance(id).await?;
    Ok(Json(bundle.to_prov_json()))
}

async fn start_analysis(
    State(state): State<SharedState>,
    Path(experiment_id): Path<i64>,
    Json(req): Json<StartAnalysisRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .coordinator
        .start_run(experiment_id, req.review_choices)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"success": true, "run_id": run.run_id})),
    ))
}

async fn run_status(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.coordinator.status(&run_id).await?))
}

async fn approve_strategy(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.coordinator.submit_review(&run_id, req).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "run_id": run.run_id,
        "current_stage": run.current_stage,
    })))
}

async fn resume_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.coordinator.resume(&run_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "success": true,
            "run_id": run.run_id,
            "current_stage": run.current_stage,
        })),
    ))
}

async fn run_provenance(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state.coordinator.run_provenance(&run_id).await?;
    Ok(Json(bundle.to_prov_json()))
}

async fn run_invocations(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let invocations = state
        .coordinator
        .context()
        .db(move |db| {
            db.require_run(&run_id)?;
            db.list_invocations(&run_id)
        })
        .await?;
    Ok(Json(invocations))
}

// ── Tests ─────────────────────────────────────────────────────────────
