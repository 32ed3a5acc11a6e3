use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failure taxonomy for the auth subsystem. Every variant carries a stable
/// HTTP classification; messages for 401s stay generic so the response never
/// reveals which credential check failed.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    /// Reset-completion failure. Covers both "no such token" and "expired" —
    /// the two cases are deliberately indistinguishable to the caller.
    #[error("Token is invalid or has expired")]
    InvalidOrExpiredToken,
    /// Mail dispatch failed; the caller must have already rolled back any
    /// reset state persisted for this request.
    #[error("There was an error sending the email. Try again later!")]
    Delivery(anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidOrExpiredToken => StatusCode::BAD_REQUEST,
            ApiError::Delivery(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Internal details are logged, never sent to the client.
            ApiError::Internal(e) => {
                error!(error = %e, "internal error");
                "Something went very wrong!".to_string()
            }
            ApiError::Delivery(e) => {
                error!(error = %e, "mail delivery failed");
                self.to_string()
            }
            other => other.to_string(),
        };
        let body = json!({
            "status": if status.is_server_error() { "error" } else { "fail" },
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}
