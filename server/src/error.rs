//! Error types for annocollabd.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("'{0}' received before join")]
    NotJoined(&'static str),

    #[error("connection already closed")]
    Closed,

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CollabError {
    /// Gateway-side failures, as opposed to a misbehaving client.
    pub fn is_gateway(&self) -> bool {
        matches!(self, CollabError::Db(_) | CollabError::Unavailable(_))
    }
}

impl IntoResponse for CollabError {
    fn into_response(self) -> Response {
        let status = match &self {
            CollabError::Protocol(_) => StatusCode::BAD_REQUEST,
            CollabError::NotJoined(_) | CollabError::Closed => StatusCode::CONFLICT,
            CollabError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CollabError::Db(_) | CollabError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
