// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker pattern using recloser crate.
//!
//! Each backend gets its own breaker. When a store keeps failing, searches
//! stop waiting out the full backend deadline on it and fail fast instead,
//! which lets the degrade policy answer OR searches from the other store
//! immediately.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Backend unhealthy, requests fail-fast without attempting
//! - HalfOpen: Testing if backend recovered, limited requests allowed
//!
//! Health checks bypass the breakers so reachability is always measured.

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::traits::BackendKind;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure ratio (0.0 - 1.0) over the closed window that trips the circuit
    pub error_rate: f32,
    /// Calls observed while closed before the rate is evaluated
    pub window: usize,
    /// Trial calls allowed while half-open
    pub half_open_trials: usize,
    /// How long to stay open before probing again
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            window: 20,
            half_open_trials: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Point lookups are cheap and frequent: judge over a wider window, recover quickly
    #[must_use]
    pub fn indexed() -> Self {
        Self {
            error_rate: 0.5,
            window: 50,
            half_open_trials: 5,
            recovery_timeout: Duration::from_secs(10),
        }
    }

    /// Scans are heavy: trip sooner and back off longer
    #[must_use]
    pub fn bulk() -> Self {
        Self {
            error_rate: 0.5,
            window: 10,
            half_open_trials: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }

    /// Fast trip and recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            error_rate: 0.5,
            window: 2,
            half_open_trials: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    state: AtomicU8,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_trials.max(1))
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last observed state.
    ///
    /// recloser does not expose its state machine, so this is inferred from
    /// call outcomes: a rejection means open, a success after a rejection
    /// means the trial call passed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn observe(&self, state: CircuitState) {
        let previous = self.state.swap(state as u8, Ordering::Relaxed);
        if previous != state as u8 {
            debug!(circuit = %self.name, from = %CircuitState::from_u8(previous), to = %state, "Circuit state changed");
            crate::metrics::set_circuit_state(&self.name, state as u8);
        }
    }

    /// Execute an async operation through the circuit breaker
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                if self.state() == CircuitState::Open {
                    self.observe(CircuitState::HalfOpen);
                } else {
                    self.observe(CircuitState::Closed);
                }
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.observe(CircuitState::Open);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Operation errors (not rejections)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls refused while open
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}

/// One breaker per backend role
pub struct BackendCircuits {
    pub indexed: CircuitBreaker,
    pub bulk: CircuitBreaker,
}

impl Default for BackendCircuits {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendCircuits {
    pub fn new() -> Self {
        Self {
            indexed: CircuitBreaker::new("indexed", CircuitConfig::indexed()),
            bulk: CircuitBreaker::new("bulk", CircuitConfig::bulk()),
        }
    }

    #[must_use]
    pub fn for_backend(&self, kind: BackendKind) -> &CircuitBreaker {
        match kind {
            BackendKind::Indexed => &self.indexed,
            BackendKind::Bulk => &self.bulk,
        }
    }

    pub fn metrics(&self) -> BackendCircuitMetrics {
        BackendCircuitMetrics {
            indexed_calls: self.indexed.calls_total(),
            indexed_failures: self.indexed.failures(),
            indexed_rejections: self.indexed.rejections(),
            bulk_calls: self.bulk.calls_total(),
            bulk_failures: self.bulk.failures(),
            bulk_rejections: self.bulk.rejections(),
        }
    }
}

/// Aggregated counters from both backend circuits
#[derive(Debug, Clone)]
pub struct BackendCircuitMetrics {
    pub indexed_calls: u64,
    pub indexed_failures: u64,
    pub indexed_rejections: u64,
    pub bulk_calls: u64,
    pub bulk_failures: u64,
    pub bulk_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;
        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_repeated_failures() {
        let config = CircuitConfig {
            recovery_timeout: Duration::from_secs(60),
            ..CircuitConfig::test()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..5 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("down") }).await;
        }
        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;

        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert!(cb.rejections() >= 1);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failure_rate() {
        let config = CircuitConfig {
            window: 100,
            ..CircuitConfig::test()
        };
        let cb = CircuitBreaker::new("test", config);
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("x") }).await;
        assert!((cb.failure_rate() - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_backend_circuits_by_kind() {
        let circuits = BackendCircuits::new();
        assert_eq!(circuits.for_backend(BackendKind::Indexed).name(), "indexed");
        assert_eq!(circuits.for_backend(BackendKind::Bulk).name(), "bulk");

        let _: Result<i32, CircuitError<&str>> = circuits.bulk.call(|| async { Err("down") }).await;
        let metrics = circuits.metrics();
        assert_eq!(metrics.bulk_calls, 1);
        assert_eq!(metrics.bulk_failures, 1);
        assert_eq!(metrics.indexed_calls, 0);
    }
}
