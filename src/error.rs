//! Error taxonomy for the search engine.
//!
//! - Validation errors are raised before planning and never reach a backend.
//! - Backend timeouts and unavailability are recovered by the degrade policy
//!   where the plan's logic allows, and surfaced otherwise.
//! - A store that answers with an error (bad query, wrong key type) is
//!   surfaced as [`SearchError::BackendFailed`] and never degraded around.
//! - Pool exhaustion is retryable.
//! - Internal inconsistencies are logged; identifier collisions never fail a
//!   request (the indexed-store record wins).

use std::time::Duration;

use thiserror::Error;

use crate::storage::traits::{BackendKind, StorageError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Invalid request ({constraint}): {detail}")]
    Validation {
        constraint: &'static str,
        detail: String,
    },

    #[error("Field '{0}' is not searchable")]
    InvalidField(String),

    #[error("The {backend} store did not answer within {deadline:?}")]
    BackendTimeout {
        backend: BackendKind,
        deadline: Duration,
    },

    #[error("The {backend} store is unavailable: {reason}")]
    BackendUnavailable {
        backend: BackendKind,
        reason: String,
    },

    #[error("The {backend} store rejected the query: {reason}")]
    BackendFailed {
        backend: BackendKind,
        reason: String,
    },

    #[error("Connection pool '{pool}' for the {backend} store is exhausted, retry with backoff")]
    ResourceExhausted {
        backend: BackendKind,
        pool: String,
    },

    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("Request is not authorized")]
    Unauthorized,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SearchError {
    /// Attribute a storage failure to the backend that raised it.
    pub fn from_storage(backend: BackendKind, err: StorageError) -> Self {
        match err {
            StorageError::Timeout { deadline, .. } => Self::BackendTimeout { backend, deadline },
            StorageError::PoolExhausted { pool, .. } => Self::ResourceExhausted { backend, pool },
            StorageError::Unavailable(reason) => Self::BackendUnavailable { backend, reason },
            StorageError::Backend(reason) => Self::BackendFailed { backend, reason },
            StorageError::Unsupported(what) => Self::InternalInconsistency(format!(
                "{} store received a predicate it cannot serve: {}",
                backend, what
            )),
            StorageError::OutOfOrder { previous, next } => Self::InternalInconsistency(format!(
                "{} store broke identifier ordering: '{}' after '{}'",
                backend, next, previous
            )),
        }
    }

    /// Whether the caller may retry the same request with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::BackendTimeout { .. } | Self::BackendUnavailable { .. }
        )
    }

    /// A store timed out or could not be reached.
    #[must_use]
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::BackendTimeout { .. } | Self::BackendUnavailable { .. })
    }

    /// Whether the request was rejected before planning.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::InvalidField(_))
    }

    /// Backend responsible for the failure, if any.
    #[must_use]
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            Self::BackendTimeout { backend, .. }
            | Self::BackendUnavailable { backend, .. }
            | Self::BackendFailed { backend, .. }
            | Self::ResourceExhausted { backend, .. } => Some(*backend),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_mapping_keeps_backend() {
        let err = SearchError::from_storage(
            BackendKind::Bulk,
            StorageError::Timeout {
                operation: "scan".into(),
                deadline: Duration::from_secs(1),
            },
        );
        assert_eq!(
            err,
            SearchError::BackendTimeout {
                backend: BackendKind::Bulk,
                deadline: Duration::from_secs(1)
            }
        );
        assert_eq!(err.backend(), Some(BackendKind::Bulk));
    }

    #[test]
    fn test_retryable_classification() {
        let exhausted = SearchError::from_storage(
            BackendKind::Indexed,
            StorageError::PoolExhausted {
                pool: "indexed".into(),
                waited: Duration::from_millis(5),
            },
        );
        assert!(exhausted.is_retryable());
        assert!(!SearchError::Unauthorized.is_retryable());
        assert!(!SearchError::InvalidField("x".into()).is_retryable());
    }

    #[test]
    fn test_query_errors_are_not_outages() {
        let err = SearchError::from_storage(BackendKind::Bulk, StorageError::Backend("no such column".into()));
        assert!(matches!(err, SearchError::BackendFailed { backend: BackendKind::Bulk, .. }));
        assert!(!err.is_outage());
        assert!(!err.is_retryable());
        assert_eq!(err.backend(), Some(BackendKind::Bulk));

        let down = SearchError::from_storage(BackendKind::Bulk, StorageError::Unavailable("refused".into()));
        assert!(down.is_outage());
    }

    #[test]
    fn test_validation_classification() {
        assert!(SearchError::InvalidField("x".into()).is_validation());
        assert!(SearchError::Validation { constraint: "limit", detail: String::new() }.is_validation());
        assert!(!SearchError::Config("x".into()).is_validation());
    }
}
