use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::process_manager_support::format_error_chain;

/// Errors surfaced to collaborators (chat handlers, HTTP routes).
///
/// `Forbidden` is returned both for a wrong key and for a target that does
/// not exist, so callers cannot discover identifiers by guessing.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("forbidden")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("path escapes data root: {0}")]
    PathEscape(String),
    #[error("no runnable entry found for {0}")]
    NoRunnableEntry(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HostError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HostError::Forbidden => StatusCode::FORBIDDEN,
            HostError::NotFound(_) => StatusCode::NOT_FOUND,
            HostError::AlreadyExists(_) => StatusCode::CONFLICT,
            HostError::InvalidTarget(_) | HostError::PathEscape(_) => StatusCode::BAD_REQUEST,
            HostError::NoRunnableEntry(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HostError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short human-readable text for end users. Internal detail stays in logs.
    pub fn user_message(&self) -> String {
        match self {
            HostError::Forbidden => "⛔ Forbidden".to_string(),
            HostError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        if let HostError::Internal(err) = &self {
            tracing::error!(error = %format_error_chain(err), "request failed");
        }
        (self.status_code(), self.user_message()).into_response()
    }
}
