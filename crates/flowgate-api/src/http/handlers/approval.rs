//! Approval decisions.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use flowgate_core::workflow::engine::ExecuteResponse;
use flowgate_types::approval::ApprovalDecision;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /api/v1/approvals/{id}/resume
///
/// Body: `{"approved": true, "decided_by": "alice", "comment": "ok"}`.
/// A second decision on the same approval is a `409`; a decision after the
/// deadline is a `410`.
pub async fn resume_approval(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(mut decision): Json<ApprovalDecision>,
) -> Result<Json<ApiResponse<ExecuteResponse>>, AppError> {
    let start = Instant::now();
    if decision.decided_by.is_none() {
        decision.decided_by = Some("api".to_string());
    }
    let response = state.engine.resume_approval(id, decision).await?;
    Ok(Json(ApiResponse::success(response, start)))
}
