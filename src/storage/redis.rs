//! Redis storage backend for the indexed store.
//!
//! Records are hashes; every indexed field has one sorted set per
//! normalised value, so an exact lookup is a single `ZRANGEBYLEX` over a
//! set that only holds the matching ids (see
//! [`crate::search::redis_translator`] for the key layout):
//!
//! ```text
//! HSET  people:rec:p42  name "Asha Singh" mobile "9876543210" ...
//! ZADD  people:idx:mobile:9876543210  0 p42
//! ZADD  people:ids                    0 p42
//! ```
//!
//! Multi-predicate lookups are combined server-side into a short-lived
//! scratch set, then paged by identifier like a single set.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, RedisError};
use tracing::{debug, info};

use crate::config::SearchEngineConfig;
use crate::record::CandidateRecord;
use crate::resilience::retry::{retry, RetryConfig};
use crate::search::matcher::normalize;
use crate::search::redis_translator::{RedisKeyspace, RedisLookup, RedisTranslator};
use crate::search::{CombineLogic, FieldPredicate};

use super::pool::ConnectionPool;
use super::traits::{BackendKind, RecordBackend, RecordStream, StorageError};

/// Scratch sets outlive any reasonable search deadline, then vanish
const SCRATCH_TTL_SECS: i64 = 300;

fn map_redis_err(e: RedisError) -> StorageError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        crate::metrics::record_connection_error("indexed");
        StorageError::Unavailable(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

pub struct RedisStore {
    connection: ConnectionManager,
    keyspace: RedisKeyspace,
    indexed_fields: Vec<String>,
    pool: ConnectionPool,
    chunk_size: usize,
}

impl RedisStore {
    /// Connect with startup-mode retry.
    ///
    /// ```rust,no_run
    /// # use record_search::{RedisStore, SearchEngineConfig};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = SearchEngineConfig {
    ///     redis_prefix: Some("people:".into()),
    ///     ..Default::default()
    /// };
    /// let store = RedisStore::new("redis://localhost", &config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(connection_string: &str, config: &SearchEngineConfig) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: RedisError| StorageError::Unavailable(e.to_string()))?;

        info!(prefix = ?config.redis_prefix, "Indexed store connected");
        Ok(Self {
            connection,
            keyspace: RedisKeyspace::new(config.redis_prefix.as_deref()),
            indexed_fields: config.indexed_fields.clone(),
            pool: ConnectionPool::new("indexed", config.indexed_pool_size, config.pool_acquire_timeout()),
            chunk_size: config.scan_chunk_size.max(1),
        })
    }

    /// Get a clone of the connection manager
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    #[must_use]
    pub fn keyspace(&self) -> &RedisKeyspace {
        &self.keyspace
    }

    /// Insert or replace records, moving ids between index sets when an
    /// indexed value changes.
    pub async fn upsert_batch(&self, records: &[CandidateRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let _conn = self.pool.acquire().await?;
        let mut conn = self.connection.clone();

        // Previous versions, to drop stale index entries
        let mut lookup = pipe();
        for record in records {
            lookup.hgetall(self.keyspace.record_key(&record.id));
        }
        let previous: Vec<HashMap<String, String>> = lookup.query_async(&mut conn).await.map_err(map_redis_err)?;

        let all_ids = self.keyspace.all_ids_key();
        retry("redis_upsert_batch", &RetryConfig::batch_write(), || {
            let mut conn = conn.clone();
            let previous = &previous;
            let all_ids = all_ids.clone();
            async move {
                let mut write = pipe();
                write.atomic();
                for (record, old) in records.iter().zip(previous.iter()) {
                    let key = self.keyspace.record_key(&record.id);
                    for field in &self.indexed_fields {
                        if let Some(value) = old.get(field) {
                            write.zrem(self.keyspace.index_key(field, &normalize(value)), &record.id);
                        }
                    }
                    write.del(&key);
                    if !record.attributes.is_empty() {
                        let pairs: Vec<(&str, &str)> =
                            record.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                        write.hset_multiple(&key, &pairs);
                    }
                    for field in &self.indexed_fields {
                        let value = normalize(record.get(field).unwrap_or(""));
                        write.zadd(self.keyspace.index_key(field, &value), &record.id, 0);
                    }
                    write.zadd(&all_ids, &record.id, 0);
                }
                write.query_async::<()>(&mut conn).await
            }
        })
        .await
        .map_err(map_redis_err)?;

        debug!(count = records.len(), "Indexed store upsert complete");
        Ok(records.len())
    }

    /// Resolve a lookup to a readable set, building a scratch set if needed.
    async fn materialize(&self, lookup: RedisLookup) -> Result<(String, Option<String>), StorageError> {
        match lookup {
            RedisLookup::Single(key) => Ok((key, None)),
            RedisLookup::Combine { op, sources } => {
                let scratch = self.keyspace.scratch_key();
                let mut conn = self.connection.clone();
                let mut p = pipe();
                p.atomic()
                    .cmd(op.command())
                    .arg(&scratch)
                    .arg(sources.len())
                    .arg(&sources)
                    .arg("AGGREGATE")
                    .arg("MIN")
                    .ignore()
                    .expire(&scratch, SCRATCH_TTL_SECS)
                    .ignore();
                p.query_async::<()>(&mut conn).await.map_err(map_redis_err)?;
                Ok((scratch.clone(), Some(scratch)))
            }
        }
    }
}

/// Deletes a scratch set when a scan is abandoned early (page full,
/// cancellation, error). A scan that runs to completion disarms it.
struct ScratchGuard {
    conn: ConnectionManager,
    key: Option<String>,
}

impl ScratchGuard {
    fn disarm(&mut self) -> Option<String> {
        self.key.take()
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else { return };
        // Outside a runtime the TTL cleans up instead
        let Ok(handle) = tokio::runtime::Handle::try_current() else { return };
        let mut conn = self.conn.clone();
        handle.spawn(async move {
            let _: Result<(), RedisError> = cmd("DEL").arg(&key).query_async(&mut conn).await;
        });
    }
}

struct ScanState {
    conn: ConnectionManager,
    keyspace: RedisKeyspace,
    pool: ConnectionPool,
    source: String,
    scratch: ScratchGuard,
    after: Option<String>,
    chunk_size: usize,
    done: bool,
}

async fn next_chunk(mut state: ScanState) -> Result<Option<(Vec<CandidateRecord>, ScanState)>, StorageError> {
    if state.done {
        return Ok(None);
    }
    let _permit = state.pool.acquire().await?;

    let ids: Vec<String> = cmd("ZRANGEBYLEX")
        .arg(&state.source)
        .arg(RedisTranslator::lex_lower_bound(state.after.as_deref()))
        .arg("+")
        .arg("LIMIT")
        .arg(0)
        .arg(state.chunk_size)
        .query_async(&mut state.conn)
        .await
        .map_err(map_redis_err)?;

    state.done = ids.len() < state.chunk_size;
    if state.done {
        if let Some(scratch) = state.scratch.disarm() {
            // Best effort: it expires anyway
            let _: Result<(), RedisError> = cmd("DEL").arg(&scratch).query_async(&mut state.conn).await;
        }
    }
    let Some(last) = ids.last().cloned() else {
        return Ok(None);
    };

    let mut fetch = pipe();
    for id in &ids {
        fetch.hgetall(state.keyspace.record_key(id));
    }
    let hashes: Vec<HashMap<String, String>> = fetch.query_async(&mut state.conn).await.map_err(map_redis_err)?;
    crate::metrics::record_chunk_rows("indexed", ids.len());

    let records = ids
        .into_iter()
        .zip(hashes)
        // An empty hash means the record was replaced mid-scan
        .filter(|(_, hash)| !hash.is_empty())
        .map(|(id, hash)| CandidateRecord {
            id,
            attributes: hash.into_iter().collect::<BTreeMap<_, _>>(),
        })
        .collect();

    state.after = Some(last);
    Ok(Some((records, state)))
}

#[async_trait]
impl RecordBackend for RedisStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Indexed
    }

    async fn execute(
        &self,
        predicates: &[FieldPredicate],
        logic: CombineLogic,
    ) -> Result<RecordStream, StorageError> {
        let lookup = RedisTranslator::translate(&self.keyspace, predicates, logic)?;
        let (source, scratch) = {
            let _permit = self.pool.acquire().await?;
            self.materialize(lookup).await?
        };
        debug!(source = %source, "Indexed lookup");

        let state = ScanState {
            conn: self.connection.clone(),
            keyspace: self.keyspace.clone(),
            pool: self.pool.clone(),
            source,
            scratch: ScratchGuard {
                conn: self.connection.clone(),
                key: scratch,
            },
            after: None,
            chunk_size: self.chunk_size,
            done: false,
        };

        Ok(stream::try_unfold(state, next_chunk)
            .map_ok(|chunk| stream::iter(chunk.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn count(&self, predicates: &[FieldPredicate], logic: CombineLogic) -> Result<u64, StorageError> {
        let lookup = RedisTranslator::translate(&self.keyspace, predicates, logic)?;
        let _permit = self.pool.acquire().await?;
        let mut conn = self.connection.clone();

        match lookup {
            RedisLookup::Single(key) => cmd("ZCARD").arg(&key).query_async(&mut conn).await.map_err(map_redis_err),
            RedisLookup::Combine { op, sources } => {
                let scratch = self.keyspace.scratch_key();
                let mut p = pipe();
                p.atomic()
                    .cmd(op.command())
                    .arg(&scratch)
                    .arg(sources.len())
                    .arg(&sources)
                    .arg("AGGREGATE")
                    .arg("MIN")
                    .del(&scratch)
                    .ignore();
                let (count,): (u64,) = p.query_async(&mut conn).await.map_err(map_redis_err)?;
                Ok(count)
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<CandidateRecord>, StorageError> {
        let _permit = self.pool.acquire().await?;
        let mut conn = self.connection.clone();
        let hash: HashMap<String, String> = cmd("HGETALL")
            .arg(self.keyspace.record_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(CandidateRecord {
            id: id.to_string(),
            attributes: hash.into_iter().collect(),
        }))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING").query_async(&mut conn).await.map_err(map_redis_err)?;
        Ok(())
    }

    async fn total_records(&self) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        cmd("ZCARD")
            .arg(self.keyspace.all_ids_key())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)
    }
}
