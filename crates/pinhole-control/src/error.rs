//! Pinhole operation errors

use pinhole_store::StoreError;
use thiserror::Error;

/// Errors returned by [`crate::PinholeManager`] operations
#[derive(Debug, Error)]
pub enum PinholeError {
    #[error("Rule store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Rule store rejected {operation}: {reason}")]
    StoreRejected {
        operation: &'static str,
        reason: String,
    },

    #[error("Pinhole not found: {0}")]
    NotFound(String),

    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("No free pinhole id: all ids are in use")]
    IdsExhausted,
}

/// Coarse error classification for callers to branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StoreUnavailable,
    StoreRejected,
    NotFound,
    NotSupported,
    IdsExhausted,
}

impl PinholeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PinholeError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            PinholeError::StoreRejected { .. } => ErrorKind::StoreRejected,
            PinholeError::NotFound(_) => ErrorKind::NotFound,
            PinholeError::NotSupported(_) => ErrorKind::NotSupported,
            PinholeError::IdsExhausted => ErrorKind::IdsExhausted,
        }
    }

    /// Map a store failure during `operation`
    pub fn from_store(operation: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::NotOpen(_) | StoreError::UnknownAnchor(_) => {
                PinholeError::StoreUnavailable(err.to_string())
            }
            other => PinholeError::StoreRejected {
                operation,
                reason: other.to_string(),
            },
        }
    }

    /// A commit that came back stale
    pub fn stale(operation: &'static str) -> Self {
        PinholeError::StoreRejected {
            operation,
            reason: "ticket is stale, the anchor changed concurrently".to_string(),
        }
    }
}
