//! Execution inspection and cancellation.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use flowgate_core::repository::workflow::WorkflowRepository;
use flowgate_types::approval::ApprovalRequest;
use flowgate_types::execution::{ExecutionStatus, WorkflowExecution};
use serde::Serialize;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

/// GET /api/v1/executions/{id} - Full record including node states and logs.
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let start = Instant::now();
    let execution = state.engine.get_execution(id).await?;
    Ok(Json(ApiResponse::success(execution, start)))
}

/// POST /api/v1/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<CancelResponse>>, AppError> {
    let start = Instant::now();
    let status = state.engine.cancel_execution(id).await?;
    Ok(Json(ApiResponse::success(
        CancelResponse {
            execution_id: id,
            status,
        },
        start,
    )))
}

/// GET /api/v1/executions/{id}/approvals
pub async fn list_approvals(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<ApprovalRequest>>>, AppError> {
    let start = Instant::now();
    // 404 for an unknown execution rather than an empty list.
    state.engine.get_execution(id).await?;
    let approvals = state.engine.repository().list_approvals(&id).await?;
    Ok(Json(ApiResponse::success(approvals, start)))
}
