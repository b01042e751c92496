use axum::http::StatusCode;
use rolegate_core::grant::GrantError;
use rolegate_core::resolver::ResolveError;
use rolegate_core::sync::SyncError;
use rolegate_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid role binding: {0}")]
    Grant(#[from] GrantError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("policy sync error: {0}")]
    Sync(#[from] SyncError),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => ApiError::NotFound(what),
            StorageError::Conflict(what) => ApiError::Conflict(what),
            other => ApiError::Storage(other),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Grant(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Storage(_) | ApiError::Resolve(_) | ApiError::Sync(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn not_found(kind: &str, name: &str) -> Self {
        ApiError::NotFound(format!("{kind} '{name}'"))
    }
}
