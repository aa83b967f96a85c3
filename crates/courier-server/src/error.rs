use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),
}

impl ServerError {
    /// Stable machine-readable kind, used as the `error` field of responses
    /// and transport `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Unauthorized(_) => "unauthorized",
            ServerError::Forbidden(_) => "forbidden",
            ServerError::NotFound(_) => "not_found",
            ServerError::Expired(_) => "expired",
            ServerError::Conflict(_) => "conflict",
            ServerError::Invalid(_) => "invalid",
            ServerError::Upstream(_) => "upstream",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Expired(_) => StatusCode::GONE,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Invalid(_) => StatusCode::BAD_REQUEST,
            ServerError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to clients. Upstream details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Upstream(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ServerError::Invalid(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ServerError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServerError::NotFound(msg.into())
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServerError::NotFound("Record not found".to_string()),
            other if other.is_constraint_violation() => {
                ServerError::Conflict("Record already exists".to_string())
            }
            other => ServerError::Upstream(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if let ServerError::Upstream(detail) = &self {
            tracing::error!(error = %detail, "Request failed");
        }

        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.public_message(),
        });

        (self.status(), axum::Json(body)).into_response()
    }
}
