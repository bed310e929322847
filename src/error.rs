//! 统一的 API 错误类型与转换。

use axum::extract::multipart::MultipartError;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::error;

use crate::admission::Rejection;
use crate::commit::CommitError;
use crate::tokens::AuthError;
use crate::tracker::TrackerError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    MethodNotAllowed { method: String, allow: &'static str },
    Unauthorized(AuthError),
    PayloadTooLarge(String),
    InsufficientStorage(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InsufficientStorage(_) => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(self) -> String {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::InsufficientStorage(msg)
            | ApiError::Internal(msg) => msg,
            ApiError::MethodNotAllowed { method, .. } => {
                format!("HTTP method \"{method}\" is not allowed")
            }
            ApiError::Unauthorized(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();
        if let ApiError::MethodNotAllowed { allow, .. } = &self {
            headers.insert(header::ALLOW, HeaderValue::from_static(allow));
        }
        let body = ErrorBody {
            ok: false,
            error: self.message(),
        };
        (status, headers, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        ApiError::Unauthorized(error)
    }
}

impl From<TrackerError> for ApiError {
    fn from(error: TrackerError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<Rejection> for ApiError {
    fn from(error: Rejection) -> Self {
        ApiError::InsufficientStorage(error.to_string())
    }
}

impl From<CommitError> for ApiError {
    fn from(error: CommitError) -> Self {
        match error {
            CommitError::TooLarge { .. } => ApiError::PayloadTooLarge(error.to_string()),
            CommitError::SizeMismatch { expected, written } => {
                error!(expected, written, "uploaded file size and written size differ");
                ApiError::Internal(error.to_string())
            }
            CommitError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        match error.status() {
            StatusCode::PAYLOAD_TOO_LARGE => ApiError::PayloadTooLarge(error.body_text()),
            StatusCode::INTERNAL_SERVER_ERROR => ApiError::Internal(error.body_text()),
            _ => ApiError::BadRequest(error.body_text()),
        }
    }
}
