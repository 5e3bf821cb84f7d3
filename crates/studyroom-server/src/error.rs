use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use studyroom_core::error::{ErrorKind, SessionError};

/// Errors surfaced by the HTTP API.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session(e) => match e.kind() {
                ErrorKind::InvalidState => "invalid-state",
                ErrorKind::Forbidden => "forbidden",
                ErrorKind::NotFound => "not-found",
                ErrorKind::InvalidArgument => "invalid-argument",
                ErrorKind::Conflict => "conflict",
            },
            Self::BadRequest(_) => "invalid-argument",
            Self::NotFound(_) => "not-found",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Session(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Forbidden => StatusCode::FORBIDDEN,
                ErrorKind::InvalidState | ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string(), "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}
