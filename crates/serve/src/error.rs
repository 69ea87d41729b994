//! `ApiError` wraps an `anyhow::Error` with the HTTP status to respond
//! with, letting handlers return `Result<Json<T>, ApiError>` and bubble
//! failures with `?`. The response body matches the `{"detail": ...}`
//! shape clients expect.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
#[error("status: {status}, error: {error}")]
pub struct ApiError {
    pub status: StatusCode,
    #[source]
    pub error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            error: anyhow::anyhow!(message.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

pub trait ApiErrorExt {
    /// Override the response status of this error.
    fn with_status(self, status: StatusCode) -> ApiError;
}

impl<E: Into<ApiError> + Sized> ApiErrorExt for E {
    fn with_status(self, status: StatusCode) -> ApiError {
        let mut err: ApiError = self.into();
        err.status = status;
        err
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error,
        }
    }
}

impl From<cache::Error> for ApiError {
    fn from(error: cache::Error) -> Self {
        anyhow::Error::from(error).into()
    }
}

impl From<registry::Error> for ApiError {
    fn from(error: registry::Error) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
        }
    }
}

impl From<iteration::Error> for ApiError {
    fn from(error: iteration::Error) -> Self {
        let status = match &error {
            iteration::Error::NoMoreIndices
            | iteration::Error::RankNotInReplicationGroup { .. }
            | iteration::Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            iteration::Error::NotInitialized => StatusCode::NOT_FOUND,
            iteration::Error::State { .. }
            | iteration::Error::Store(_)
            | iteration::Error::Model(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            error: error.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = format!("{:#}", self.error);
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, detail, "request failed");
        }
        (
            self.status,
            axum::Json(serde_json::json!({ "detail": detail })),
        )
            .into_response()
    }
}
