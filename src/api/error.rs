//! API error handling: orchestrator errors mapped to HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::{DatabaseError, OrchestratorError};

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
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::JobNotFound { .. } | OrchestratorError::WorkerNotFound { .. } => {
                ApiError::NotFound(message)
            }
            OrchestratorError::InvalidRequest(_) => ApiError::BadRequest(message),
            OrchestratorError::DuplicateSubmission { .. }
            | OrchestratorError::WorkerTerminated { .. }
            | OrchestratorError::WorkerLimitReached { .. }
            | OrchestratorError::InvalidWorkerTransition { .. }
            | OrchestratorError::JobNotTerminal { .. }
            | OrchestratorError::StaleReport { .. } => ApiError::Conflict(message),
            OrchestratorError::Database(_) => ApiError::Internal(message),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
