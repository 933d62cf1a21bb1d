//! Telemetry recorder.
//!
//! Every completed search feeds one process-wide aggregate: a running mean
//! of execution time, a 24-slot hourly ring for the rolling day, and a
//! bounded log of recent searches. Callers only ever get copies.
//!
//! ```text
//! hour slot:  0   1   2  ...  23
//! tag:       h0  h1  h2  ...  h23   (absolute hour the slot was last reset)
//! ```
//!
//! A slot whose tag is older than the current hour minus 24 no longer counts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::search::SearchRequest;

const HOURS: usize = 24;

/// Snapshot returned by the stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub total_records: u64,
    pub avg_search_time_ms: f64,
    pub searches_last_24h: u64,
}

/// One completed search, as kept in the in-memory log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchLogEntry {
    pub search_id: String,
    /// See [`crate::search::SearchRequest::fingerprint`]
    pub fingerprint: String,
    pub total_count: u64,
    pub result_count: usize,
    pub execution_time_ms: u64,
    pub partial: bool,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    /// The requests this search answered, base first, so it can be narrowed later
    #[serde(skip)]
    pub criteria: Vec<SearchRequest>,
}

#[derive(Debug, Default)]
struct Aggregate {
    searches: u64,
    mean_ms: f64,
    slots: [u64; HOURS],
    tags: [u64; HOURS],
}

impl Aggregate {
    fn add(&mut self, elapsed_ms: u64, hour: u64) {
        self.searches += 1;
        // Incremental mean
        self.mean_ms += (elapsed_ms as f64 - self.mean_ms) / self.searches as f64;

        let slot = (hour % HOURS as u64) as usize;
        if self.tags[slot] != hour {
            self.tags[slot] = hour;
            self.slots[slot] = 0;
        }
        self.slots[slot] += 1;
    }

    fn last_24h(&self, hour: u64) -> u64 {
        let oldest = hour.saturating_sub(HOURS as u64 - 1);
        self.slots
            .iter()
            .zip(self.tags.iter())
            .filter(|(_, tag)| **tag >= oldest && **tag <= hour)
            .map(|(count, _)| *count)
            .sum()
    }
}

pub struct TelemetryRecorder {
    aggregate: Mutex<Aggregate>,
    log: Mutex<VecDeque<SearchLogEntry>>,
    capacity: usize,
    last_total_records: AtomicU64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl TelemetryRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            aggregate: Mutex::new(Aggregate::default()),
            log: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            last_total_records: AtomicU64::new(0),
        }
    }

    /// Fresh, collision-free search identifier.
    #[must_use]
    pub fn new_search_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Fold a completed search into the aggregate and the log.
    pub fn record(&self, entry: SearchLogEntry) {
        let hour = entry.timestamp / 3600;
        let last_24h = {
            let mut agg = self.aggregate.lock();
            agg.add(entry.execution_time_ms, hour);
            agg.last_24h(hour)
        };
        crate::metrics::set_searches_last_24h(last_24h);

        if self.capacity == 0 {
            return;
        }
        let mut log = self.log.lock();
        while log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Build a log entry stamped with the current time.
    #[must_use]
    pub fn entry(
        search_id: String,
        fingerprint: String,
        total_count: u64,
        result_count: usize,
        execution_time_ms: u64,
        partial: bool,
    ) -> SearchLogEntry {
        SearchLogEntry {
            search_id,
            fingerprint,
            total_count,
            result_count,
            execution_time_ms,
            partial,
            timestamp: unix_now(),
            criteria: Vec::new(),
        }
    }

    /// Criteria of a logged search, if it is still in the log.
    #[must_use]
    pub fn criteria(&self, search_id: &str) -> Option<Vec<SearchRequest>> {
        self.log
            .lock()
            .iter()
            .rev()
            .find(|e| e.search_id == search_id)
            .map(|e| e.criteria.clone())
    }

    /// Completed searches since start.
    #[must_use]
    pub fn total_searches(&self) -> u64 {
        self.aggregate.lock().searches
    }

    #[must_use]
    pub fn searches_last_24h(&self) -> u64 {
        self.searches_last_24h_at(unix_now())
    }

    #[must_use]
    pub fn searches_last_24h_at(&self, now_secs: u64) -> u64 {
        self.aggregate.lock().last_24h(now_secs / 3600)
    }

    #[must_use]
    pub fn average_ms(&self) -> f64 {
        self.aggregate.lock().mean_ms
    }

    /// Remember the latest corpus size so stats survive a store outage.
    pub fn set_total_records(&self, total: u64) {
        self.last_total_records.store(total, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_total_records(&self) -> u64 {
        self.last_total_records.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> DatabaseStats {
        self.snapshot_at(unix_now())
    }

    #[must_use]
    pub fn snapshot_at(&self, now_secs: u64) -> DatabaseStats {
        let agg = self.aggregate.lock();
        DatabaseStats {
            total_records: self.last_total_records(),
            avg_search_time_ms: agg.mean_ms,
            searches_last_24h: agg.last_24h(now_secs / 3600),
        }
    }

    /// Explicit rollover: forget the rolling day and restart the mean.
    pub fn reset_window(&self) {
        let mut agg = self.aggregate.lock();
        *agg = Aggregate::default();
        crate::metrics::set_searches_last_24h(0);
    }

    /// Newest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<SearchLogEntry> {
        self.log.lock().iter().rev().take(n).cloned().collect()
    }
}
