//! Error types for the shared cache
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for the cache engine and its HTTP surface.
///
/// The first five variants are ordinary negative outcomes. None of them
/// leave the arena in an inconsistent state and callers are free to treat
/// them as "no value / false".
#[derive(Error, Debug)]
pub enum CacheError {
    /// The arena (or a pool carved from it) ran out of memory
    #[error("Allocation failure: unable to allocate {requested} bytes")]
    AllocationFailure { requested: usize },

    /// Key absent or expired
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Atomic updater applied to an incompatible value
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Exclusive insert against a live key
    #[error("Key already exists: {0}")]
    ExclusivityConflict(String),

    /// Insert suppressed because another caller is rebuilding the key
    #[error("Slam defense active for key: {0}")]
    SlamGuardActive(String),

    /// Empty or oversized key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Serializer failed to encode or decode a value
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configured serializer is not registered
    #[error("Unknown serializer: {0}")]
    UnknownSerializer(String),

    /// Shared memory region is missing, foreign or not initialized
    #[error("Invalid arena: {0}")]
    InvalidArena(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// System call error (via rustix)
    #[error("System error: {0}")]
    System(#[from] rustix::io::Errno),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking cache call panicked or was cancelled
    #[error("Cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CacheError {
    /// Returns true for outcomes that mean "the key is not there".
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::KeyNotFound(_))
    }

    /// Returns true for the recoverable, non-fatal outcomes of a cache call.
    pub fn is_negative_result(&self) -> bool {
        matches!(
            self,
            CacheError::AllocationFailure { .. }
                | CacheError::KeyNotFound(_)
                | CacheError::TypeMismatch(_)
                | CacheError::ExclusivityConflict(_)
                | CacheError::SlamGuardActive(_)
        )
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            CacheError::TypeMismatch(_)
            | CacheError::ExclusivityConflict(_)
            | CacheError::SlamGuardActive(_) => StatusCode::CONFLICT,
            CacheError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            CacheError::AllocationFailure { .. } => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_results_are_classified() {
        assert!(CacheError::KeyNotFound("k".into()).is_miss());
        assert!(CacheError::KeyNotFound("k".into()).is_negative_result());
        assert!(CacheError::AllocationFailure { requested: 8 }.is_negative_result());
        assert!(CacheError::SlamGuardActive("k".into()).is_negative_result());
        assert!(!CacheError::InvalidKey("".into()).is_negative_result());
        assert!(!CacheError::Config("x".into()).is_miss());
    }

    #[test]
    fn test_error_status_codes() {
        let resp = CacheError::KeyNotFound("k".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = CacheError::ExclusivityConflict("k".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = CacheError::AllocationFailure { requested: 1 }.into_response();
        assert_eq!(resp.status(), StatusCode::INSUFFICIENT_STORAGE);
    }
}
