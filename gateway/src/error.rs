//! API error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dispatch::DispatchError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Error body returned by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// Whether the same request may be retried unchanged
    pub retryable: bool,
}

/// An error on its way to the client.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.into(),
                retryable: false,
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::InvalidTransition { .. }
            | DispatchError::DuplicateRequest(_)
            | DispatchError::ResponderMismatch { .. } => StatusCode::CONFLICT,
            DispatchError::ResponderUnavailable(_) | DispatchError::LedgerAppendFailed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::AlertNotFound(_) | DispatchError::ResponderNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::InvalidRequest(_) | DispatchError::Zone(_) => StatusCode::BAD_REQUEST,
            DispatchError::LedgerIntegrityViolation(_)
            | DispatchError::Replay { .. }
            | DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(code = err.code(), error = %err, "Request failed");
        }

        Self {
            status,
            body: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                retryable: err.is_retryable(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.body }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
