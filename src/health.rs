// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Health aggregator.
//!
//! Pings both stores in parallel with a short deadline and folds the
//! answers into one status. A check never fails: an error or a timeout is
//! reported as "unreachable".
//!
//! The JSON field names follow the deployed roles of the two stores:
//! `postgresql` is the indexed store, `clickhouse` the bulk store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::storage::traits::RecordBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Down,
}

impl OverallStatus {
    #[must_use]
    pub fn from_reachability(indexed: bool, bulk: bool) -> Self {
        match (indexed, bulk) {
            (true, true) => Self::Healthy,
            (false, false) => Self::Down,
            _ => Self::Degraded,
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Composite availability, computed fresh on every check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub status: OverallStatus,
    /// Indexed store reachable
    #[serde(rename = "postgresql")]
    pub indexed: bool,
    /// Bulk store reachable
    #[serde(rename = "clickhouse")]
    pub bulk: bool,
}

impl HealthStatus {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == OverallStatus::Healthy
    }
}

pub struct HealthAggregator {
    indexed: Arc<dyn RecordBackend>,
    bulk: Arc<dyn RecordBackend>,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(indexed: Arc<dyn RecordBackend>, bulk: Arc<dyn RecordBackend>, timeout: Duration) -> Self {
        Self { indexed, bulk, timeout }
    }

    pub async fn check(&self) -> HealthStatus {
        let (indexed, bulk) = tokio::join!(
            check_backend(self.indexed.as_ref(), self.timeout),
            check_backend(self.bulk.as_ref(), self.timeout)
        );
        HealthStatus {
            status: OverallStatus::from_reachability(indexed, bulk),
            indexed,
            bulk,
        }
    }
}

async fn check_backend(backend: &dyn RecordBackend, timeout: Duration) -> bool {
    let kind = backend.kind();
    let start = Instant::now();

    let reachable = match tokio::time::timeout(timeout, backend.ping()).await {
        Ok(Ok(())) => {
            debug!(backend = %kind, latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX), "Health check ok");
            true
        }
        Ok(Err(e)) => {
            warn!(backend = %kind, error = %e, "Health check failed");
            false
        }
        Err(_) => {
            warn!(backend = %kind, timeout = ?timeout, "Health check timed out");
            false
        }
    };

    crate::metrics::set_backend_healthy(kind.as_str(), reachable);
    reachable
}
