use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

use crate::record::CandidateRecord;
use crate::search::{CombineLogic, FieldPredicate};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend call '{operation}' exceeded its deadline of {deadline:?}")]
    Timeout {
        operation: String,
        deadline: Duration,
    },
    #[error("Connection pool '{pool}' exhausted after waiting {waited:?}")]
    PoolExhausted {
        pool: String,
        waited: Duration,
    },
    #[error("Unsupported predicate for this backend: {0}")]
    Unsupported(String),
    #[error("Stream out of order: '{next}' followed '{previous}'")]
    OutOfOrder {
        previous: String,
        next: String,
    },
}

impl StorageError {
    /// The store could not be reached or did not answer in time.
    /// Only outages may be degraded around; a store that answers with an
    /// error (bad query, wrong key type) is surfaced.
    #[must_use]
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// The two backend roles the planner can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Low-latency indexed store for exact/point lookups.
    Indexed,
    /// Bulk columnar store for substring scans across the whole corpus.
    Bulk,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Indexed => "indexed",
            Self::Bulk => "bulk",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lazy, finite stream of candidates ordered by identifier ascending.
///
/// Restartable only by calling [`RecordBackend::execute`] again. Dropping the
/// stream releases whatever connection it holds.
pub type RecordStream = BoxStream<'static, Result<CandidateRecord, StorageError>>;

#[async_trait]
pub trait RecordBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Stream every record satisfying `predicates` combined by `logic`,
    /// ascending by identifier, without materialising the match set.
    async fn execute(
        &self,
        predicates: &[FieldPredicate],
        logic: CombineLogic,
    ) -> Result<RecordStream, StorageError>;

    /// Size of the match set for `predicates`, without fetching rows.
    async fn count(
        &self,
        predicates: &[FieldPredicate],
        logic: CombineLogic,
    ) -> Result<u64, StorageError>;

    /// Fetch one record by identifier. `Ok(None)` when the store has no such record.
    async fn get(&self, id: &str) -> Result<Option<CandidateRecord>, StorageError>;

    /// Lightweight liveness check.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Count total records in the store.
    async fn total_records(&self) -> Result<u64, StorageError>;
}
