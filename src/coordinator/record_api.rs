//! Point reads by record identifier.
//!
//! ```text
//! get_record(id)
//!     ├─→ indexed store ── found ──→ record
//!     │        │ missing or unreachable
//!     └─→ bulk store ───── found ──→ record
//!              │ missing
//!              └─→ None (or the indexed outage, if there was one)
//! ```

use tokio::time::{timeout_at, Instant as Deadline};
use tracing::{debug, warn};

use crate::error::SearchError;
use crate::metrics::{self, LatencyTimer};
use crate::record::CandidateRecord;
use crate::resilience::circuit_breaker::CircuitError;
use crate::storage::traits::{BackendKind, StorageError};

use super::{Access, SearchEngine};

impl SearchEngine {
    /// Fetch one record by identifier, indexed store first.
    ///
    /// An unreachable store is skipped in favour of the other; a store that
    /// answers with a query error fails the call. `Ok(None)` means neither
    /// store has the record. If a store was unreachable and the other did
    /// not have it, the outage is returned instead, since the record may
    /// still exist.
    pub async fn get_record(&self, access: Access, id: &str) -> Result<Option<CandidateRecord>, SearchError> {
        access.check()?;
        if id.trim().is_empty() {
            metrics::record_validation_rejected("id");
            return Err(SearchError::Validation {
                constraint: "id",
                detail: "record id must not be empty".into(),
            });
        }

        let deadline = Deadline::now() + self.config.backend_timeout();
        let mut outage = None;
        for kind in [BackendKind::Indexed, BackendKind::Bulk] {
            match self.fetch_from(kind, id, deadline).await {
                Ok(Some(record)) => {
                    debug!(id = %id, backend = %kind, "Record found");
                    return Ok(Some(record));
                }
                Ok(None) => {}
                Err(e) if e.is_outage() => {
                    warn!(id = %id, backend = %kind, error = %e, "Skipping unreachable store for point read");
                    outage.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        match outage {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn fetch_from(
        &self,
        kind: BackendKind,
        id: &str,
        deadline: Deadline,
    ) -> Result<Option<CandidateRecord>, SearchError> {
        let backend = self.backend(kind);
        let budget = self.config.backend_timeout();
        let _timer = LatencyTimer::new(kind.as_str(), "get");

        let result = self
            .circuits
            .for_backend(kind)
            .call(move || async move {
                match timeout_at(deadline, backend.get(id)).await {
                    Ok(result) => result,
                    Err(_) => Err(StorageError::Timeout {
                        operation: "get".into(),
                        deadline: budget,
                    }),
                }
            })
            .await;

        match result {
            Ok(found) => {
                metrics::record_backend_call(kind.as_str(), "get", "ok");
                Ok(found)
            }
            Err(CircuitError::Rejected) => {
                metrics::record_backend_call(kind.as_str(), "get", "rejected");
                Err(SearchError::BackendUnavailable {
                    backend: kind,
                    reason: "circuit breaker open".into(),
                })
            }
            Err(CircuitError::Inner(e)) => {
                if matches!(e, StorageError::Timeout { .. }) {
                    metrics::record_timeout(kind.as_str(), "get");
                }
                metrics::record_backend_call(kind.as_str(), "get", "error");
                Err(SearchError::from_storage(kind, e))
            }
        }
    }
}
