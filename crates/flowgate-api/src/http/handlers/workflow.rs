//! Workflow definition and execution-start handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use flowgate_core::repository::workflow::WorkflowRepository;
use flowgate_core::workflow::definition::parse_workflow_json;
use flowgate_core::workflow::engine::{ExecuteOptions, ExecuteResponse};
use flowgate_types::execution::{ExecutionStatus, WorkflowExecution};
use flowgate_types::workflow::Workflow;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body for `POST /workflows/{id}/execute`.
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteBody {
    #[serde(default)]
    pub input: Value,
    #[serde(default, rename = "triggeredBy", alias = "triggered_by")]
    pub triggered_by: Option<String>,
    #[serde(flatten)]
    pub options: ExecuteOptions,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

const MAX_PAGE: u32 = 100;

/// POST /api/v1/workflows - Validate and store a definition (JSON).
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<ApiResponse<Workflow>>), AppError> {
    let start = Instant::now();
    let workflow = parse_workflow_json(&body.to_string())?;
    let workflow = state.engine.create_workflow(workflow).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(workflow, start))))
}

/// GET /api/v1/workflows
pub async fn list_workflows(State(state): State<AppState>) -> Result<Json<ApiResponse<Vec<Workflow>>>, AppError> {
    let start = Instant::now();
    let workflows = state.engine.repository().list_workflows().await?;
    Ok(Json(ApiResponse::success(workflows, start)))
}

/// GET /api/v1/workflows/{id}
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Workflow>>, AppError> {
    let start = Instant::now();
    let workflow = state
        .engine
        .repository()
        .get_workflow(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {id} not found")))?;
    Ok(Json(ApiResponse::success(workflow, start)))
}

/// POST /api/v1/workflows/{id}/execute
///
/// Runs inline unless `async` is set; queued runs answer `202 Accepted`.
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ExecuteBody>>,
) -> Result<(StatusCode, Json<ApiResponse<ExecuteResponse>>), AppError> {
    let start = Instant::now();
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let triggered_by = body.triggered_by.as_deref().unwrap_or("api");
    let response = state
        .engine
        .execute(id, triggered_by, body.input, body.options)
        .await?;
    let status = if response.status == ExecutionStatus::Queued {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(response, start))))
}

/// GET /api/v1/workflows/{id}/executions?limit&offset
///
/// Newest first. Node states are left out of the listing.
pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowExecution>>>, AppError> {
    let start = Instant::now();
    let executions = state
        .engine
        .list_executions(id, page.limit.clamp(1, MAX_PAGE), page.offset)
        .await?;
    Ok(Json(ApiResponse::success(executions, start)))
}
