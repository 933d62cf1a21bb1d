// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded connection permits.
//!
//! Backends whose client is multiplexed (Redis `ConnectionManager`, the
//! in-memory store) still need a hard cap on concurrent calls. A
//! [`ConnectionPool`] hands out RAII permits; acquiring blocks up to the
//! configured deadline and then fails with [`StorageError::PoolExhausted`]
//! instead of queueing without bound.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use super::traits::StorageError;

#[derive(Clone)]
pub struct ConnectionPool {
    name: String,
    permits: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
}

/// Held for the lifetime of one backend call or one streamed chunk.
/// Released on drop, on every exit path.
pub struct PooledConnection {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionPool {
    pub fn new(name: impl Into<String>, size: usize, acquire_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(size)),
            size,
            acquire_timeout,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<PooledConnection, StorageError> {
        match tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(PooledConnection { _permit: permit }),
            Ok(Err(_closed)) => Err(StorageError::Unavailable(format!(
                "connection pool '{}' is closed",
                self.name
            ))),
            Err(_) => {
                warn!(pool = %self.name, waited = ?self.acquire_timeout, "Connection pool exhausted");
                crate::metrics::record_pool_exhausted(&self.name);
                Err(StorageError::PoolExhausted {
                    pool: self.name.clone(),
                    waited: self.acquire_timeout,
                })
            }
        }
    }

    /// Stop handing out permits; pending and future acquires fail.
    pub fn close(&self) {
        self.permits.close();
    }
}
