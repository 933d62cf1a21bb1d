// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Result Merger & Paginator
//!
//! Merge-joins per-backend candidate streams, each ascending by identifier,
//! into one deduplicated ascending sequence, then slices the requested
//! offset/limit window out of it.
//!
//! ```text
//! indexed: a ─ c ─ d ────────┐
//!                            ├─ OR  → a b c d e
//! bulk:    b ─ c ─ e ────────┘  AND → c
//! ```
//!
//! Only one head record per source is held at a time, so memory is bounded
//! by the page size regardless of how many rows the backends match.
//!
//! When two sources yield the same identifier, the record from the source
//! listed first wins (plans list the indexed store first). Differing
//! attributes are logged and counted as an identifier collision; they never
//! fail the request.
//!
//! An [`Intersection`] stacks whole merges on top of each other, which is how
//! a search is narrowed by a later refinement.

use std::cmp::Ordering;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::warn;

use crate::error::SearchError;
use crate::record::CandidateRecord;
use crate::storage::traits::{BackendKind, RecordStream, StorageError};

use super::request::CombineLogic;

/// One backend's candidate stream, tagged with where it came from.
pub struct SourceStream {
    pub backend: BackendKind,
    pub stream: RecordStream,
}

impl SourceStream {
    pub fn new(backend: BackendKind, stream: RecordStream) -> Self {
        Self { backend, stream }
    }
}

struct Cursor {
    backend: BackendKind,
    stream: RecordStream,
    head: Option<CandidateRecord>,
    last_id: Option<String>,
    exhausted: bool,
}

impl Cursor {
    /// Pull until a head is available or the stream ends, enforcing
    /// ascending order. A repeated identifier within one stream is skipped.
    async fn fill(&mut self) -> Result<(), StorageError> {
        while self.head.is_none() && !self.exhausted {
            match self.stream.next().await {
                None => self.exhausted = true,
                Some(Err(e)) => return Err(e),
                Some(Ok(record)) => {
                    if let Some(last) = &self.last_id {
                        match record.id.as_str().cmp(last.as_str()) {
                            Ordering::Less => {
                                return Err(StorageError::OutOfOrder {
                                    previous: last.clone(),
                                    next: record.id,
                                });
                            }
                            Ordering::Equal => continue,
                            Ordering::Greater => {}
                        }
                    }
                    self.last_id = Some(record.id.clone());
                    self.head = Some(record);
                }
            }
        }
        Ok(())
    }

    fn head_id(&self) -> Option<&str> {
        self.head.as_ref().map(|r| r.id.as_str())
    }
}

/// A deduplicated sequence of records ascending by identifier, pulled one at a time.
#[async_trait]
pub trait MergedSequence: Send {
    /// Next record, or `None` when the sequence is exhausted.
    async fn next_record(&mut self) -> Result<Option<CandidateRecord>, SearchError>;
}

/// Streaming merge-join over ascending candidate streams.
pub struct MergeJoin {
    cursors: Vec<Cursor>,
    logic: CombineLogic,
    degraded: Vec<BackendKind>,
}

impl MergeJoin {
    pub fn new(sources: Vec<SourceStream>, logic: CombineLogic) -> Self {
        let cursors = sources
            .into_iter()
            .map(|s| Cursor {
                backend: s.backend,
                stream: s.stream,
                head: None,
                last_id: None,
                exhausted: false,
            })
            .collect();
        Self {
            cursors,
            logic,
            degraded: Vec::new(),
        }
    }

    /// Backends dropped mid-stream under OR logic.
    #[must_use]
    pub fn degraded(&self) -> &[BackendKind] {
        &self.degraded
    }

    /// Adapt into a lazy stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<CandidateRecord, SearchError>> {
        stream::try_unfold(self, |mut merge| async move {
            Ok::<_, SearchError>(merge.next_record().await?.map(|record| (record, merge)))
        })
        .boxed()
    }

    async fn fill_all(&mut self) -> Result<(), SearchError> {
        let results = join_all(self.cursors.iter_mut().map(|c| c.fill())).await;

        let mut failed: Vec<(usize, StorageError)> = results
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| r.err().map(|e| (i, e)))
            .collect();
        if failed.is_empty() {
            return Ok(());
        }

        let can_degrade = self.logic == CombineLogic::Or
            && failed.len() < self.cursors.len()
            && failed.iter().all(|(_, e)| e.is_outage());
        if !can_degrade {
            let (index, err) = failed.swap_remove(0);
            return Err(SearchError::from_storage(self.cursors[index].backend, err));
        }

        for (index, err) in failed.into_iter().rev() {
            let cursor = self.cursors.remove(index);
            warn!(
                backend = %cursor.backend,
                error = %err,
                "Dropping failed source mid-stream, continuing with remaining backends"
            );
            crate::metrics::record_degraded(cursor.backend.as_str());
            self.degraded.push(cursor.backend);
        }
        Ok(())
    }

    /// Consume every head carrying `id`; the first source's record wins.
    fn take_matching(&mut self, id: &str) -> Option<CandidateRecord> {
        let mut winner: Option<(BackendKind, CandidateRecord)> = None;
        for cursor in &mut self.cursors {
            if cursor.head_id() != Some(id) {
                continue;
            }
            let Some(record) = cursor.head.take() else { continue };
            match &winner {
                None => winner = Some((cursor.backend, record)),
                Some((kept_from, kept)) => {
                    let divergent = kept.divergent_fields(&record);
                    if !divergent.is_empty() {
                        warn!(
                            id = %id,
                            kept = %kept_from,
                            discarded = %cursor.backend,
                            fields = ?divergent,
                            "Identifier collision with conflicting attributes"
                        );
                        crate::metrics::record_identifier_collision();
                    }
                }
            }
        }
        winner.map(|(_, record)| record)
    }
}

#[async_trait]
impl MergedSequence for MergeJoin {
    async fn next_record(&mut self) -> Result<Option<CandidateRecord>, SearchError> {
        if self.cursors.is_empty() {
            return Ok(None);
        }

        loop {
            self.fill_all().await?;

            match self.logic {
                CombineLogic::Or => {
                    let Some(min) = self.cursors.iter().filter_map(Cursor::head_id).min().map(str::to_string)
                    else {
                        return Ok(None);
                    };
                    if let Some(record) = self.take_matching(&min) {
                        return Ok(Some(record));
                    }
                }
                CombineLogic::And => {
                    // Any exhausted source empties the intersection
                    if self.cursors.iter().any(|c| c.head.is_none()) {
                        return Ok(None);
                    }
                    let Some(max) = self.cursors.iter().filter_map(Cursor::head_id).max().map(str::to_string)
                    else {
                        return Ok(None);
                    };
                    if self.cursors.iter().all(|c| c.head_id() == Some(max.as_str())) {
                        if let Some(record) = self.take_matching(&max) {
                            return Ok(Some(record));
                        }
                    } else {
                        for cursor in &mut self.cursors {
                            if cursor.head_id().is_some_and(|id| id < max.as_str()) {
                                cursor.head = None;
                            }
                        }
                    }
                }
            }
        }
    }
}

struct Part {
    merge: MergeJoin,
    head: Option<CandidateRecord>,
    exhausted: bool,
}

impl Part {
    async fn fill(&mut self) -> Result<(), SearchError> {
        if self.head.is_none() && !self.exhausted {
            match self.merge.next_record().await? {
                Some(record) => self.head = Some(record),
                None => self.exhausted = true,
            }
        }
        Ok(())
    }
}

/// Records present in every one of several merged sequences.
///
/// Each part is already deduplicated and ascending, so this is an AND
/// merge-join one level up. The first part's record wins.
pub struct Intersection {
    parts: Vec<Part>,
}

impl Intersection {
    pub fn new(merges: Vec<MergeJoin>) -> Self {
        let parts = merges
            .into_iter()
            .map(|merge| Part {
                merge,
                head: None,
                exhausted: false,
            })
            .collect();
        Self { parts }
    }

    /// Backends any part dropped mid-stream, without repeats.
    #[must_use]
    pub fn degraded(&self) -> Vec<BackendKind> {
        let mut out: Vec<BackendKind> = Vec::new();
        for kind in self.parts.iter().flat_map(|p| p.merge.degraded()) {
            if !out.contains(kind) {
                out.push(*kind);
            }
        }
        out
    }
}

#[async_trait]
impl MergedSequence for Intersection {
    async fn next_record(&mut self) -> Result<Option<CandidateRecord>, SearchError> {
        if self.parts.is_empty() {
            return Ok(None);
        }

        loop {
            for result in join_all(self.parts.iter_mut().map(|p| p.fill())).await {
                result?;
            }
            if self.parts.iter().any(|p| p.head.is_none()) {
                return Ok(None);
            }
            let Some(max) = self
                .parts
                .iter()
                .filter_map(|p| p.head.as_ref().map(|r| r.id.clone()))
                .max()
            else {
                return Ok(None);
            };

            let aligned = self
                .parts
                .iter()
                .all(|p| p.head.as_ref().is_some_and(|r| r.id == max));
            let mut winner = None;
            for part in &mut self.parts {
                if part.head.as_ref().is_some_and(|r| aligned || r.id < max) {
                    let record = part.head.take();
                    winner = winner.or(record);
                }
            }
            if aligned {
                return Ok(winner);
            }
        }
    }
}

/// The requested window of a merged sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct PageWindow {
    pub records: Vec<CandidateRecord>,
    /// Records consumed from the sequence. Equals the sequence size when
    /// the window was taken with `count_rest`.
    pub seen: u64,
}

/// Skip `offset`, keep up to `limit`.
///
/// With `count_rest` the remainder is drained (without being kept) so that
/// `seen` is the size of the whole deduplicated set; otherwise consumption
/// stops once the page is full.
pub async fn paginate<M: MergedSequence + ?Sized>(
    merge: &mut M,
    limit: usize,
    offset: u64,
    count_rest: bool,
) -> Result<PageWindow, SearchError> {
    let mut records = Vec::with_capacity(limit.min(1024));
    let mut seen = 0u64;

    while let Some(record) = merge.next_record().await? {
        seen += 1;
        if seen > offset && records.len() < limit {
            records.push(record);
        } else if !count_rest && records.len() >= limit {
            break;
        }
    }

    Ok(PageWindow { records, seen })
}

/// `offset + page_len < total`
#[must_use]
pub fn has_more(offset: u64, page_len: usize, total: u64) -> bool {
    offset.saturating_add(page_len as u64) < total
}
