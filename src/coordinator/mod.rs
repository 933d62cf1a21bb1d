// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Search engine coordinator.
//!
//! The [`SearchEngine`] ties together all components:
//! - Query planner over the configured field set
//! - Indexed store (exact lookups) and bulk store (substring scans)
//! - Per-backend circuit breakers
//! - Telemetry recorder and health aggregator
//!
//! # Request path
//!
//! ```text
//! Access gate → validate → plan → fan out (join, bounded by deadline)
//!     → merge-join → paginate → telemetry → SearchResponse
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use record_search::{Access, CandidateRecord, InMemoryStore, SearchEngine, SearchEngineConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = SearchEngineConfig::default();
//! let indexed = InMemoryStore::indexed(config.indexed_fields.clone());
//! let bulk = InMemoryStore::bulk();
//! let person = CandidateRecord::new("p1").with("mobile", "9876543210").with("name", "Asha Singh");
//! indexed.upsert_batch(vec![person.clone()]).unwrap();
//! bulk.upsert_batch(vec![person]).unwrap();
//!
//! let engine = SearchEngine::new(config, Arc::new(indexed), Arc::new(bulk)).unwrap();
//! let page = engine
//!     .search_json(Access::Authorized, r#"{"query":"9876543210","fields":["mobile"],"match_type":"full"}"#)
//!     .await
//!     .unwrap();
//! assert_eq!(page.total_count, 1);
//! # }
//! ```

mod types;
mod search_api;
mod record_api;

pub use types::{Access, SearchResponse};

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::SearchEngineConfig;
use crate::error::SearchError;
use crate::health::{HealthAggregator, HealthStatus};
use crate::resilience::circuit_breaker::BackendCircuits;
use crate::search::QueryPlanner;
use crate::storage::redis::RedisStore;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{BackendKind, RecordBackend};
use crate::telemetry::{DatabaseStats, SearchLogEntry, TelemetryRecorder};

/// Query-execution core over one indexed and one bulk store.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; share it behind an `Arc`. Requests share
/// no per-request state; the telemetry aggregate is the only shared
/// mutable resource and is internally synchronized.
pub struct SearchEngine {
    pub(super) config: SearchEngineConfig,
    pub(super) planner: QueryPlanner,
    pub(super) indexed: Arc<dyn RecordBackend>,
    pub(super) bulk: Arc<dyn RecordBackend>,
    pub(super) circuits: BackendCircuits,
    pub(super) telemetry: TelemetryRecorder,
    pub(super) health: HealthAggregator,
}

impl SearchEngine {
    /// Build an engine over any pair of backends.
    ///
    /// Fails on an invalid configuration (including an empty field set) or
    /// when a backend is passed in the wrong role.
    pub fn new(
        config: SearchEngineConfig,
        indexed: Arc<dyn RecordBackend>,
        bulk: Arc<dyn RecordBackend>,
    ) -> Result<Self, SearchError> {
        config.validate()?;
        for (expected, backend) in [(BackendKind::Indexed, &indexed), (BackendKind::Bulk, &bulk)] {
            if backend.kind() != expected {
                return Err(SearchError::Config(format!(
                    "{} backend passed as the {} store",
                    backend.kind(),
                    expected
                )));
            }
        }

        let health = HealthAggregator::new(Arc::clone(&indexed), Arc::clone(&bulk), config.health_timeout());
        Ok(Self {
            planner: QueryPlanner::from_config(&config),
            telemetry: TelemetryRecorder::new(config.search_log_capacity),
            circuits: BackendCircuits::new(),
            indexed,
            bulk,
            health,
            config,
        })
    }

    /// Connect to Redis (indexed) and SQL (bulk) from the configured URLs.
    ///
    /// Both connections use startup retry, so a wrong URL fails within a
    /// few seconds rather than hanging.
    pub async fn connect(config: SearchEngineConfig) -> Result<Self, SearchError> {
        config.validate()?;
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| SearchError::Config("redis_url is required".into()))?;
        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| SearchError::Config("sql_url is required".into()))?;

        let start = Instant::now();
        let indexed = RedisStore::new(&redis_url, &config)
            .await
            .map_err(|e| SearchError::from_storage(BackendKind::Indexed, e))?;
        crate::metrics::record_startup_phase("indexed_connect", start.elapsed());

        let start = Instant::now();
        let bulk = SqlStore::new(&sql_url, &config)
            .await
            .map_err(|e| SearchError::from_storage(BackendKind::Bulk, e))?;
        crate::metrics::record_startup_phase("bulk_connect", start.elapsed());

        info!("Search engine connected to both stores");
        Self::new(config, Arc::new(indexed), Arc::new(bulk))
    }

    #[must_use]
    pub fn config(&self) -> &SearchEngineConfig {
        &self.config
    }

    #[must_use]
    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    #[must_use]
    pub fn circuits(&self) -> &BackendCircuits {
        &self.circuits
    }

    #[must_use]
    pub fn telemetry(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    pub(super) fn backend(&self, kind: BackendKind) -> &Arc<dyn RecordBackend> {
        match kind {
            BackendKind::Indexed => &self.indexed,
            BackendKind::Bulk => &self.bulk,
        }
    }

    /// Check both stores. Never fails; unreachable stores are reported as such.
    #[tracing::instrument(skip(self))]
    pub async fn health(&self) -> HealthStatus {
        let status = self.health.check().await;
        info!(status = %status.status, indexed = status.indexed, bulk = status.bulk, "Health check");
        status
    }

    /// Operational statistics.
    ///
    /// The corpus size comes from the bulk store, then the indexed store,
    /// then the last value either of them reported.
    #[tracing::instrument(skip(self))]
    pub async fn stats(&self, access: Access) -> Result<DatabaseStats, SearchError> {
        access.check()?;

        let timeout = self.config.backend_timeout();
        for backend in [&self.bulk, &self.indexed] {
            match tokio::time::timeout(timeout, backend.total_records()).await {
                Ok(Ok(total)) => {
                    self.telemetry.set_total_records(total);
                    break;
                }
                Ok(Err(e)) => warn!(backend = %backend.kind(), error = %e, "Failed to refresh record count"),
                Err(_) => warn!(backend = %backend.kind(), ?timeout, "Record count timed out"),
            }
        }
        Ok(self.telemetry.snapshot())
    }

    /// Newest-first snapshot of the search log.
    #[must_use]
    pub fn recent_searches(&self, n: usize) -> Vec<SearchLogEntry> {
        self.telemetry.recent(n)
    }
}
