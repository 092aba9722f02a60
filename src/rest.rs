//! REST surface (§6.1): observability and control over HTTP. Thin routing
//! and status-code mapping over [`Api`]; no business logic lives here.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::api::{Api, StartRequest};
use crate::error::ApiError;
use crate::model::{Event, Run, RunStatus};
use crate::observability::{HealthStatus, WorkflowMetadata};
use crate::persistence::{Pagination, RunFilter, RunPage, StorageContract};
use crate::scheduler::Broker;

pub struct AppState<S: StorageContract, B: Broker> {
    pub api: Arc<Api<S, B>>,
}

impl<S: StorageContract, B: Broker> Clone for AppState<S, B> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
        }
    }
}

/// OpenAPI document for the surface below (§6.1), served at `/docs`.
#[derive(OpenApi)]
#[openapi(paths(list_runs_doc, get_run_doc, get_events_doc, create_run_doc, cancel_run_doc, signal_hook_doc, list_workflows_doc, health_doc))]
pub struct ApiDoc;

pub fn routes<S: StorageContract + 'static, B: Broker + 'static>(state: AppState<S, B>) -> Router {
    Router::new()
        .route("/runs", get(list_runs::<S, B>).post(create_run::<S, B>))
        .route("/runs/:run_id", get(get_run::<S, B>))
        .route("/runs/:run_id/events", get(get_events::<S, B>))
        .route("/runs/:run_id/cancel", post(cancel_run::<S, B>))
        .route("/hooks/:run_id/:hook_name", post(signal_hook::<S, B>))
        .route("/workflows", get(list_workflows::<S, B>))
        .route("/health", get(health::<S, B>))
        .merge(SwaggerUi::new("/docs").url("/docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// The handlers above are generic over `S, B` so `utoipa`'s `#[utoipa::path]`
// (which needs concrete, `'static`-free signatures) documents them through
// these non-generic stand-ins rather than the handlers themselves.
#[utoipa::path(get, path = "/runs", responses((status = 200, description = "Paginated run list")))]
fn list_runs_doc() {}

#[utoipa::path(get, path = "/runs/{run_id}", responses((status = 200, description = "Run detail"), (status = 404, description = "Unknown run")))]
fn get_run_doc() {}

#[utoipa::path(get, path = "/runs/{run_id}/events", responses((status = 200, description = "Ordered event log")))]
fn get_events_doc() {}

#[utoipa::path(post, path = "/runs", responses((status = 201, description = "Run created"), (status = 409, description = "Idempotency conflict")))]
fn create_run_doc() {}

#[utoipa::path(post, path = "/runs/{run_id}/cancel", responses((status = 200, description = "Cancellation requested")))]
fn cancel_run_doc() {}

#[utoipa::path(post, path = "/hooks/{run_id}/{hook_name}", responses((status = 200, description = "Hook signalled"), (status = 410, description = "Hook not pending")))]
fn signal_hook_doc() {}

#[utoipa::path(get, path = "/workflows", responses((status = 200, description = "Registered workflow types")))]
fn list_workflows_doc() {}

#[utoipa::path(get, path = "/health", responses((status = 200, description = "Health status")))]
fn health_doc() {}

fn map_api_error(err: ApiError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        ApiError::RunNotFound(_) | ApiError::HookNotFound { .. } => StatusCode::NOT_FOUND,
        ApiError::IdempotencyConflict { .. } => StatusCode::CONFLICT,
        ApiError::Validation(_) | ApiError::UnknownWorkflow(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err.to_string()})))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsParams {
    pub query: Option<String>,
    pub status: Option<RunStatus>,
    pub cursor: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

async fn list_runs<S: StorageContract, B: Broker>(
    State(state): State<AppState<S, B>>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<RunPage>, (StatusCode, Json<Value>)> {
    let filter = RunFilter {
        workflow_name: params.query,
        status: params.status,
        created_after: None,
        created_before: None,
    };
    let pagination = Pagination {
        cursor: params.cursor,
        limit: params.limit,
    };
    state.api.list_runs(filter, pagination).await.map(Json).map_err(map_api_error)
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub workflow_name: String,
    #[serde(default)]
    pub kwargs: Value,
    pub idempotency_key: Option<String>,
}

async fn create_run<S: StorageContract, B: Broker>(
    State(state): State<AppState<S, B>>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let request = StartRequest {
        idempotency_key: req.idempotency_key,
        ..Default::default()
    };
    let run_id = state
        .api
        .start(&req.workflow_name, req.kwargs, request)
        .await
        .map_err(map_api_error)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({"run_id": run_id}))))
}

async fn get_run<S: StorageContract, B: Broker>(
    State(state): State<AppState<S, B>>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Run>, (StatusCode, Json<Value>)> {
    state.api.get_run(run_id).await.map(Json).map_err(map_api_error)
}

async fn get_events<S: StorageContract, B: Broker>(
    State(state): State<AppState<S, B>>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Vec<Event>>, (StatusCode, Json<Value>)> {
    state.api.get_events(run_id).await.map(Json).map_err(map_api_error)
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRunRequest {
    pub reason: Option<String>,
}

async fn cancel_run<S: StorageContract, B: Broker>(
    State(state): State<AppState<S, B>>,
    Path(run_id): Path<Uuid>,
    body: Option<Json<CancelRunRequest>>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let reason = body.and_then(|Json(req)| req.reason);
    state.api.cancel(run_id, reason).await.map_err(map_api_error)?;
    Ok(StatusCode::OK)
}

async fn signal_hook<S: StorageContract, B: Broker>(
    State(state): State<AppState<S, B>>,
    Path((run_id, hook_name)): Path<(Uuid, String)>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .api
        .signal_hook(run_id, &hook_name, payload)
        .await
        .map_err(|err| match err {
            ApiError::HookNotFound { .. } => (StatusCode::GONE, Json(serde_json::json!({"error": err.to_string()}))),
            other => map_api_error(other),
        })?;
    Ok(Json(serde_json::json!({"accepted": true})))
}

async fn list_workflows<S: StorageContract, B: Broker>(
    State(state): State<AppState<S, B>>,
) -> Json<Vec<WorkflowMetadata>> {
    let names: Vec<WorkflowMetadata> = state
        .api
        .registered_workflow_types()
        .into_iter()
        .map(|name| WorkflowMetadata { name })
        .collect();
    Json(names)
}

async fn health<S: StorageContract, B: Broker>(State(state): State<AppState<S, B>>) -> Json<HealthStatus> {
    let storage_healthy = state
        .api
        .list_runs(RunFilter::default(), Pagination { cursor: None, limit: 1 })
        .await
        .is_ok();
    Json(HealthStatus {
        status: if storage_healthy { "ok" } else { "degraded" },
        storage_healthy,
    })
}
