use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use jobboard_adapters::SourceError;
use jobboard_storage::StoreError;
use jobboard_sync::SyncError;
use serde_json::json;
use tracing::error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("{0}")]
    SourceUnavailable(String),

    #[error("{0}")]
    Store(#[from] StoreError),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::MissingBoard => ApiError::BadRequest("Board token is required".to_string()),
            SyncError::Source(SourceError::InvalidBoard(board)) => {
                ApiError::BadRequest(format!("Invalid board token: {board}"))
            }
            SyncError::Source(other) => ApiError::SourceUnavailable(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Validation(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::SourceUnavailable(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Store(StoreError::Domain(err)) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Store(err) => {
                error!(error = %err, "job store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
