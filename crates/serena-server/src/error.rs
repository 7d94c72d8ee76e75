use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use serena_engine::WarehouseError;

/// Errors returned by the HTTP routes, rendered as `{"detail": ..}`.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<WarehouseError> for ServerError {
    fn from(e: WarehouseError) -> Self {
        match e {
            WarehouseError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            WarehouseError::Io(_) | WarehouseError::Metadata(_) => Self::Internal(e.to_string()),
            WarehouseError::Rejected(_) | WarehouseError::Query(_) => Self::BadRequest(e.to_string()),
        }
    }
}

/// A connection pump stopped abnormally.
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("live session closed")]
    SessionClosed,

    #[error("pump task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
