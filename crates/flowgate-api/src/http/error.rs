//! Application error type mapping engine failures to HTTP status codes and
//! the envelope format.

use std::time::Instant;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowgate_core::workflow::definition::DefinitionError;
use flowgate_core::workflow::error::EngineError;
use flowgate_types::error::RepositoryError;

use crate::http::response::ApiResponse;

#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    /// Malformed request body or definition.
    Validation(String),
    NotFound(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Engine(EngineError::Repository(e))
    }
}

impl From<DefinitionError> for AppError {
    fn from(e: DefinitionError) -> Self {
        match e {
            DefinitionError::Invalid(v) => AppError::Engine(EngineError::Validation(v)),
            other => AppError::Validation(other.to_string()),
        }
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Engine(e) => match e {
                EngineError::Validation(_) | EngineError::UnknownNodeType(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                EngineError::WorkflowNotFound(_)
                | EngineError::ExecutionNotFound(_)
                | EngineError::ApprovalNotFound(_)
                | EngineError::Repository(RepositoryError::NotFound) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                EngineError::ApprovalNotPending { .. }
                | EngineError::ApprovalConflict(_)
                | EngineError::NotResumable { .. }
                | EngineError::Repository(RepositoryError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
                EngineError::ApprovalExpired { .. } => (StatusCode::GONE, "APPROVAL_EXPIRED"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR"),
            },
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Engine(e) => e.to_string(),
            AppError::Validation(msg) | AppError::NotFound(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(code, error = %self.message(), "request failed");
        }
        (status, Json(ApiResponse::error(code, self.message(), Instant::now()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::workflow::error::ValidationError;
    use flowgate_types::approval::ApprovalStatus;
    use uuid::Uuid;

    fn status(e: impl Into<AppError>) -> StatusCode {
        e.into().status_and_code().0
    }

    #[test]
    fn maps_engine_errors_to_statuses() {
        let id = Uuid::now_v7();
        assert_eq!(
            status(EngineError::Validation(ValidationError::CycleDetected("a".into()))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status(EngineError::WorkflowNotFound(id)), StatusCode::NOT_FOUND);
        assert_eq!(
            status(EngineError::ApprovalNotPending {
                id,
                status: ApprovalStatus::Approved
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status(EngineError::ApprovalConflict(id)), StatusCode::CONFLICT);
        assert_eq!(status(EngineError::ApprovalExpired { approval_id: id }), StatusCode::GONE);
        assert_eq!(status(RepositoryError::Connection), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status(RepositoryError::NotFound), StatusCode::NOT_FOUND);
    }

    #[test]
    fn definition_errors_are_bad_requests() {
        assert_eq!(status(DefinitionError::Parse("bad".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(DefinitionError::Invalid(ValidationError::EmptyWorkflow)),
            StatusCode::BAD_REQUEST
        );
    }
}
