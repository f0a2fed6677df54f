//! HTTP error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::engine::EngineError;
use crate::sync::SyncError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Gateway error: {0}")]
    BadGateway(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::BadGateway(_) => "BAD_GATEWAY",
        }
    }

    /// Categorize an anyhow error by its message.
    ///
    /// - "not found" -> NotFound
    /// - "already exists" / "in use" -> Conflict
    /// - "invalid" / "must" / "cannot" -> BadRequest
    /// - "unavailable" / "connection refused" -> ServiceUnavailable
    /// - anything else -> Internal
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let msg = format!("{err:#}");
        let lower = msg.to_lowercase();

        if lower.contains("not found") {
            ApiError::NotFound(msg)
        } else if lower.contains("already exists") || lower.contains("in use") {
            ApiError::Conflict(msg)
        } else if lower.contains("invalid") || lower.contains("must") || lower.contains("cannot") {
            ApiError::BadRequest(msg)
        } else if lower.contains("unavailable") || lower.contains("connection refused") {
            ApiError::ServiceUnavailable(msg)
        } else {
            error!(error = %msg, "Unclassified failure");
            ApiError::internal(INTERNAL_MESSAGE)
        }
    }
}

/// Body text for failures whose detail stays in the log.
const INTERNAL_MESSAGE: &str = "internal error";

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        (
            status,
            Json(ErrorResponse {
                error: message,
                code,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_anyhow(err)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ContainerNotFound(_) | EngineError::ImageNotFound(_) => {
                ApiError::NotFound(err.user_message())
            }
            EngineError::InvalidInput(_) => ApiError::BadRequest(err.user_message()),
            EngineError::Unavailable(_) => ApiError::ServiceUnavailable(err.user_message()),
            _ => ApiError::BadGateway(err.user_message()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            // The mirror is intact; the engine just could not be listed.
            SyncError::Engine(e) => ApiError::ServiceUnavailable(format!(
                "container synchronization failed: {}",
                e.user_message()
            )),
            SyncError::Storage(e) => {
                error!(error = %format!("{e:#}"), "Storage failure");
                ApiError::internal(INTERNAL_MESSAGE)
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
