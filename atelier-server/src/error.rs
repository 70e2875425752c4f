use atelier_core::LifecycleError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

/// An error rendered as `{ "error": .., "code": .. }`.
#[derive(Debug)]
pub enum ApiError {
    Lifecycle(LifecycleError),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Lifecycle(LifecycleError::DownloadInProgress(_)) => StatusCode::CONFLICT,
            Self::Lifecycle(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Lifecycle(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        Self::Lifecycle(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Lifecycle(LifecycleError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::Lifecycle(err) => ErrorBody {
                error: err.to_string(),
                code: err.code(),
            },
            Self::NotFound(what) => ErrorBody {
                error: format!("{what} not found"),
                code: "NOT_FOUND",
            },
            Self::Internal(message) => ErrorBody {
                error: message,
                code: "INTERNAL",
            },
        };
        if status.is_server_error() {
            error!(code = body.code, error = %body.error, "request failed");
        }
        (status, Json(body)).into_response()
    }
}
