use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::common::response::ErrorBody;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidCombination(String),

    #[error("invalid job token")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("too many active jobs (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("result expired")]
    Gone,

    #[error("result not available yet")]
    NotReady,

    #[error("{0}")]
    Conflict(String),

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_combination(msg: impl Into<String>) -> Self {
        Self::InvalidCombination(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::InvalidCombination(_) => "invalid_combination",
            AppError::Forbidden => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::CapacityExceeded { .. } => "capacity_exceeded",
            AppError::Gone => "gone",
            AppError::NotReady => "not_ready",
            AppError::Conflict(_) => "conflict",
            AppError::Processing(_) => "processing",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCombination(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) | AppError::NotReady => StatusCode::NOT_FOUND,
            AppError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Gone => StatusCode::GONE,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Processing(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let (message, details) = match &self {
            AppError::Processing(_) | AppError::Internal(_) => {
                error!(error = %self, "Request failed with internal error");
                ("An internal error occurred".to_string(), None)
            }
            AppError::CapacityExceeded { limit } => (self.to_string(), Some(json!({ "limit": limit }))),
            _ => (self.to_string(), None),
        };

        let body = ErrorBody {
            kind: self.kind().to_string(),
            message,
            details,
        };

        (status, Json(body)).into_response()
    }
}
