use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failure taxonomy for every core operation. Rejections are reported
/// synchronously to the caller (HTTP status, or the room-socket `error`
/// event) and leave no partial state behind — except the documented
/// read-status fan-out case, which is logged and never surfaces here.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    AuthorizationDenied(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    ValidationFailed(&'static str),

    /// Store unavailable or inconsistent; nothing downstream of the failing
    /// step (fan-out, broadcast) has executed.
    #[error("persistence failure")]
    Persistence(#[from] anyhow::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Self::Persistence(e) => {
                error!("persistence failure: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
