use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::engine::SyncError;
use crate::store::StoreError;

/// Problem-details style error body.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    pub title: String,
    pub status: u16,
    pub code: String,
    pub detail: String,
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: ProblemDetails,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            problem: ProblemDetails {
                title: status.canonical_reason().unwrap_or("Unknown Error").to_string(),
                status: status.as_u16(),
                code: code.to_string(),
                detail: detail.into(),
                retryable: false,
            },
        }
    }

    pub fn bad_request(code: &str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, detail)
    }

    pub fn not_found(code: &str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, detail)
    }

    pub fn conflict(code: &str, detail: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::CONFLICT, code, detail);
        err.problem.retryable = true;
        err
    }

    pub fn internal(code: &str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, detail)
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Store(StoreError::NotFound(id)) => {
                Self::not_found("workspace_not_found", format!("workspace {id} not found"))
            }
            other => Self::internal("sync_failed", other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.problem)).into_response()
    }
}
