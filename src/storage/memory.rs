//! In-memory record store.
//!
//! Serves either backend role. As the indexed store it answers `Equals`
//! predicates from per-field value sets (`(field, normalised value) → ids`)
//! and refuses substring matches, mirroring the Redis store. As the bulk
//! store it scans records in identifier order and evaluates any predicate.
//!
//! Streams are produced in chunks under a pool permit, like the SQL store,
//! and the store can be taken offline or slowed down for failure testing.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::RwLock;

use crate::record::CandidateRecord;
use crate::search::matcher::{matches_all, normalize, Comparator};
use crate::search::{CombineLogic, FieldPredicate};

use super::pool::ConnectionPool;
use super::traits::{BackendKind, RecordBackend, RecordStream, StorageError};

const DEFAULT_CHUNK_SIZE: usize = 1000;
const DEFAULT_POOL_SIZE: usize = 64;

struct Inner {
    kind: BackendKind,
    records: RwLock<BTreeMap<String, CandidateRecord>>,
    index: DashMap<(String, String), BTreeSet<String>>,
    indexed_fields: BTreeSet<String>,
    pool: ConnectionPool,
    online: AtomicBool,
    latency_ms: AtomicU64,
    chunk_size: usize,
}

#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Indexed-role store keeping lookup sets for `indexed_fields`.
    pub fn indexed<I, S>(indexed_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(BackendKind::Indexed, indexed_fields.into_iter().map(Into::into).collect())
    }

    /// Bulk-role store that scans.
    #[must_use]
    pub fn bulk() -> Self {
        Self::build(BackendKind::Bulk, BTreeSet::new())
    }

    fn build(kind: BackendKind, indexed_fields: BTreeSet<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                records: RwLock::new(BTreeMap::new()),
                index: DashMap::new(),
                indexed_fields,
                pool: ConnectionPool::new(kind.as_str(), DEFAULT_POOL_SIZE, Duration::from_secs(5)),
                online: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                chunk_size: DEFAULT_CHUNK_SIZE,
            }),
        }
    }

    /// Replace the connection pool. Only valid before the store is shared.
    #[must_use]
    pub fn with_pool(self, pool: ConnectionPool) -> Self {
        self.rebuild(|inner| inner.pool = pool)
    }

    #[must_use]
    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        self.rebuild(|inner| inner.chunk_size = chunk_size.max(1))
    }

    fn rebuild(self, f: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self { inner: Arc::new(inner) }
            }
            // Already shared: keep as is
            Err(inner) => Self { inner },
        }
    }

    /// Insert or replace records, keeping the lookup sets in step.
    pub fn upsert_batch(&self, records: Vec<CandidateRecord>) -> Result<usize, StorageError> {
        self.inner.check_online()?;
        let count = records.len();
        let mut map = self.inner.records.write();
        for record in records {
            if let Some(previous) = map.remove(&record.id) {
                self.inner.unindex(&previous);
            }
            self.inner.index_record(&record);
            map.insert(record.id.clone(), record);
        }
        Ok(count)
    }

    /// Take the store offline (every call fails as unavailable) or back online.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Artificial delay applied before every call and every streamed chunk.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.records.write().clear();
        self.inner.index.clear();
    }
}

impl Inner {
    fn check_online(&self) -> Result<(), StorageError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!("{} store is offline", self.kind)))
        }
    }

    async fn simulate_io(&self) -> Result<(), StorageError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check_online()
    }

    fn index_record(&self, record: &CandidateRecord) {
        for field in &self.indexed_fields {
            let value = normalize(record.get(field).unwrap_or(""));
            self.index.entry((field.clone(), value)).or_default().insert(record.id.clone());
        }
    }

    fn unindex(&self, record: &CandidateRecord) {
        for field in &self.indexed_fields {
            let key = (field.clone(), normalize(record.get(field).unwrap_or("")));
            if let Some(mut ids) = self.index.get_mut(&key) {
                ids.remove(&record.id);
            }
            self.index.remove_if(&key, |_, ids| ids.is_empty());
        }
    }

    /// Up to `limit` matching records with identifier greater than `after`.
    fn chunk(
        &self,
        predicates: &[FieldPredicate],
        logic: CombineLogic,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CandidateRecord>, StorageError> {
        let records = self.records.read();
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };

        match self.kind {
            BackendKind::Bulk => Ok(records
                .range((lower, Bound::Unbounded))
                .map(|(_, r)| r)
                .filter(|r| predicates.is_empty() || matches_all(predicates, logic, r))
                .take(limit)
                .cloned()
                .collect()),
            BackendKind::Indexed => {
                let ids: Vec<String> = match self.lookup_keys(predicates, logic)? {
                    None => records.range((lower, Bound::Unbounded)).map(|(id, _)| id.clone()).take(limit).collect(),
                    Some(keys) => self.ids_after(&keys, logic, &lower, limit),
                };
                Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
            }
        }
    }

    /// Index keys to combine, or `None` when every record qualifies.
    fn lookup_keys(
        &self,
        predicates: &[FieldPredicate],
        logic: CombineLogic,
    ) -> Result<Option<Vec<(String, String)>>, StorageError> {
        let mut keys = Vec::with_capacity(predicates.len());
        for p in predicates {
            match p.comparator {
                Comparator::Always if logic == CombineLogic::Or => return Ok(None),
                Comparator::Always => {}
                Comparator::Equals if self.indexed_fields.contains(&p.field) => {
                    keys.push((p.field.clone(), p.value.clone()));
                }
                Comparator::Equals => {
                    return Err(StorageError::Unsupported(format!("field '{}' is not indexed", p.field)));
                }
                Comparator::Contains => {
                    return Err(StorageError::Unsupported(format!(
                        "substring match on '{}' has no index",
                        p.field
                    )));
                }
            }
        }
        Ok(if keys.is_empty() { None } else { Some(keys) })
    }

    fn ids_after(
        &self,
        keys: &[(String, String)],
        logic: CombineLogic,
        lower: &Bound<String>,
        limit: usize,
    ) -> Vec<String> {
        let sets: Vec<BTreeSet<String>> = keys
            .iter()
            .map(|k| self.index.get(k).map(|s| s.value().clone()).unwrap_or_default())
            .collect();
        let range = |set: &BTreeSet<String>| -> Vec<String> {
            set.range((lower.clone(), Bound::Unbounded)).cloned().collect()
        };

        match logic {
            CombineLogic::Or => {
                let mut union = BTreeSet::new();
                for set in &sets {
                    union.extend(range(set).into_iter().take(limit));
                }
                union.into_iter().take(limit).collect()
            }
            CombineLogic::And => {
                let Some(smallest) = sets.iter().min_by_key(|s| s.len()) else {
                    return Vec::new();
                };
                range(smallest)
                    .into_iter()
                    .filter(|id| sets.iter().all(|s| s.contains(id)))
                    .take(limit)
                    .collect()
            }
        }
    }

    fn count_matches(&self, predicates: &[FieldPredicate], logic: CombineLogic) -> Result<u64, StorageError> {
        let records = self.records.read();
        let count = match self.kind {
            BackendKind::Bulk => records
                .values()
                .filter(|r| predicates.is_empty() || matches_all(predicates, logic, r))
                .count(),
            BackendKind::Indexed => match self.lookup_keys(predicates, logic)? {
                None => records.len(),
                Some(keys) => self.ids_after(&keys, logic, &Bound::Unbounded, usize::MAX).len(),
            },
        };
        Ok(count as u64)
    }
}

struct ScanState {
    inner: Arc<Inner>,
    predicates: Vec<FieldPredicate>,
    logic: CombineLogic,
    after: Option<String>,
    done: bool,
}

async fn next_chunk(mut state: ScanState) -> Result<Option<(Vec<CandidateRecord>, ScanState)>, StorageError> {
    if state.done {
        return Ok(None);
    }
    let _conn = state.inner.pool.acquire().await?;
    state.inner.simulate_io().await?;

    let size = state.inner.chunk_size;
    let chunk = state.inner.chunk(&state.predicates, state.logic, state.after.as_deref(), size)?;
    state.done = chunk.len() < size;
    let Some(last) = chunk.last() else {
        return Ok(None);
    };
    state.after = Some(last.id.clone());
    Ok(Some((chunk, state)))
}

#[async_trait]
impl RecordBackend for InMemoryStore {
    fn kind(&self) -> BackendKind {
        self.inner.kind
    }

    async fn execute(
        &self,
        predicates: &[FieldPredicate],
        logic: CombineLogic,
    ) -> Result<RecordStream, StorageError> {
        // Reject unservable predicates before handing out a stream
        if self.inner.kind == BackendKind::Indexed {
            self.inner.lookup_keys(predicates, logic)?;
        }
        let _conn = self.inner.pool.acquire().await?;
        self.inner.simulate_io().await?;

        let state = ScanState {
            inner: Arc::clone(&self.inner),
            predicates: predicates.to_vec(),
            logic,
            after: None,
            done: false,
        };

        let chunks = stream::try_unfold(state, next_chunk);

        Ok(chunks
            .map_ok(|chunk| stream::iter(chunk.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn count(&self, predicates: &[FieldPredicate], logic: CombineLogic) -> Result<u64, StorageError> {
        let _conn = self.inner.pool.acquire().await?;
        self.inner.simulate_io().await?;
        self.inner.count_matches(predicates, logic)
    }

    async fn get(&self, id: &str) -> Result<Option<CandidateRecord>, StorageError> {
        let _conn = self.inner.pool.acquire().await?;
        self.inner.simulate_io().await?;
        Ok(self.inner.records.read().get(id).cloned())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.simulate_io().await
    }

    async fn total_records(&self) -> Result<u64, StorageError> {
        self.inner.simulate_io().await?;
        Ok(self.len() as u64)
    }
}
