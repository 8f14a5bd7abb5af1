use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a signature did not verify.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("no webhook secret configured")]
    MissingSecret,

    #[error("signature missing")]
    MissingSignature,

    #[error("signature is not valid hex")]
    MalformedSignature,

    #[error("signature length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("signature mismatch")]
    Mismatch,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("delivery already recorded: {0}")]
    DuplicateKey(String),

    #[error("webhook not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("invalid target url: {0}")]
    InvalidTarget(String),

    #[error("replay target timed out after {0}s")]
    Timeout(u64),

    #[error("replay target unreachable: {0}")]
    TargetUnreachable(String),
}

#[derive(Debug, Error)]
#[error("hook {hook} failed: {message}")]
pub struct HookError {
    pub hook: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("maximum connection limit ({0}) reached")]
    ConnectionLimit(usize),
}

/// Error surfaced by the query/replay API. Always rendered as a JSON body
/// with a stable `code`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("replay failed: {0}")]
    Replay(#[from] ReplayError),

    #[error("storage unavailable")]
    StorageUnavailable,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Replay(_) => "REPLAY_FAILED",
            ApiError::StorageUnavailable => "STORAGE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Replay(ReplayError::InvalidTarget(_)) => StatusCode::BAD_REQUEST,
            ApiError::Replay(ReplayError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Replay(ReplayError::TargetUnreachable(_)) => StatusCode::BAD_GATEWAY,
            ApiError::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("webhook not found: {id}")),
            StoreError::DuplicateKey(id) => {
                ApiError::BadRequest(format!("delivery already recorded: {id}"))
            }
            StoreError::StorageUnavailable(e) => {
                tracing::error!(error = %e, "storage unavailable");
                ApiError::StorageUnavailable
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "code": self.code(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_errors_map_to_gateway_statuses() {
        let err = ApiError::from(ReplayError::TargetUnreachable("refused".into()));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.code(), "REPLAY_FAILED");

        let err = ApiError::from(ReplayError::Timeout(10));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn storage_failure_hides_io_details() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "/var/lib/secret/path");
        let err = ApiError::from(StoreError::StorageUnavailable(io));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.to_string(), "storage unavailable");
    }

    #[test]
    fn store_not_found_becomes_404() {
        let err = ApiError::from(StoreError::NotFound("abc".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.to_string(), "webhook not found: abc");
    }
}
