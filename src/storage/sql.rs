// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend for the bulk store.
//!
//! One row per record, one TEXT column per searchable field plus a
//! `<field>_norm` shadow column that searches compare against:
//! ```sql
//! CREATE TABLE people (
//!   id VARCHAR(191) PRIMARY KEY,   -- binary collation: ordering matches byte order
//!   mobile TEXT, mobile_norm TEXT,
//!   name TEXT,   name_norm TEXT,
//!   ...
//! )
//! ```
//!
//! Shadow columns are written by [`SqlStore::upsert_batch`] with the same
//! normalisation the in-memory matcher uses, so Unicode case folding and
//! whitespace trimming never depend on the dialect.
//!
//! Searches stream in keyset-paginated chunks (`id > last ORDER BY id LIMIT n`),
//! so no query ever holds more than one chunk in memory and a connection is
//! only checked out while a chunk is being fetched. Dropping the stream
//! between chunks releases everything.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver may hand TEXT columns back as BLOB, so string columns
//! are read as `String` first and fall back to `Vec<u8>`.

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use crate::config::SearchEngineConfig;
use crate::record::CandidateRecord;
use crate::resilience::retry::{retry, RetryConfig};
use crate::search::matcher::normalize;
use crate::search::sql_translator::{SqlParam, SqlQuery, SqlTranslator};
use crate::search::{CombineLogic, FieldPredicate};

use super::traits::{BackendKind, RecordBackend, RecordStream, StorageError};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Rows per multi-row INSERT (keeps MySQL packets well under max_allowed_packet)
const UPSERT_CHUNK: usize = 500;

struct Shared {
    pool: AnyPool,
    table: String,
    columns: Vec<String>,
    chunk_size: usize,
    acquire_timeout: Duration,
}

impl Shared {
    fn map_err(&self, err: sqlx::Error) -> StorageError {
        match err {
            sqlx::Error::PoolTimedOut => {
                crate::metrics::record_pool_exhausted("bulk");
                StorageError::PoolExhausted {
                    pool: "bulk".to_string(),
                    waited: self.acquire_timeout,
                }
            }
            sqlx::Error::PoolClosed => StorageError::Unavailable("connection pool closed".to_string()),
            // Connection-class failures: the server was not reachable
            e @ (sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed) => {
                crate::metrics::record_connection_error("bulk");
                StorageError::Unavailable(e.to_string())
            }
            // The server answered: bad SQL, missing column, decode failure
            other => StorageError::Backend(other.to_string()),
        }
    }

    async fn fetch(&self, query: SqlQuery) -> Result<Vec<AnyRow>, StorageError> {
        let mut q = sqlx::query(&query.clause);
        for param in query.params {
            q = match param {
                SqlParam::Text(s) => q.bind(s),
                SqlParam::Integer(n) => q.bind(n),
            };
        }
        q.fetch_all(&self.pool).await.map_err(|e| self.map_err(e))
    }

    async fn fetch_count(&self, query: SqlQuery) -> Result<u64, StorageError> {
        let rows = self.fetch(query).await?;
        let Some(row) = rows.first() else {
            return Ok(0);
        };
        let count: i64 = row.try_get(0).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn row_to_record(&self, row: &AnyRow) -> Result<CandidateRecord, StorageError> {
        let id = read_text(row, "id")?.ok_or_else(|| StorageError::Backend("row without id".to_string()))?;
        let mut record = CandidateRecord::new(id);
        for column in &self.columns {
            if let Some(value) = read_text(row, column)? {
                record.attributes.insert(column.clone(), value);
            }
        }
        Ok(record)
    }
}

/// TEXT column as `String`, tolerating the Any driver's BLOB mapping and NULLs.
fn read_text(row: &AnyRow, column: &str) -> Result<Option<String>, StorageError> {
    if let Ok(value) = row.try_get::<Option<String>, _>(column) {
        return Ok(value);
    }
    match row.try_get::<Option<Vec<u8>>, _>(column) {
        Ok(bytes) => Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned())),
        Err(e) => Err(StorageError::Backend(format!("column '{}': {}", column, e))),
    }
}

#[derive(Clone)]
pub struct SqlStore {
    shared: Arc<Shared>,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the table if missing.
    pub async fn new(connection_string: &str, config: &SearchEngineConfig) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        let acquire_timeout = config.pool_acquire_timeout();
        let max_connections = u32::try_from(config.bulk_pool_size).unwrap_or(u32::MAX);

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(acquire_timeout)
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))
        })
        .await?;

        let store = Self {
            shared: Arc::new(Shared {
                pool,
                table: config.sql_table.clone(),
                columns: config.searchable_fields.clone(),
                chunk_size: config.scan_chunk_size.max(1),
                acquire_timeout,
            }),
            is_sqlite,
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;

        info!(table = %store.shared.table, sqlite = is_sqlite, "Bulk store connected");
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.shared.pool.clone()
    }

    /// WAL mode lets scans run while loads write.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.shared.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.shared.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        // Shadow columns compare byte-for-byte on MySQL, as they do in SQLite
        let norm_type = if self.is_sqlite { "TEXT" } else { "TEXT CHARACTER SET utf8mb4 COLLATE utf8mb4_bin" };
        let columns: String = self
            .shared
            .columns
            .iter()
            .map(|c| format!(", {} TEXT, {} {}", c, SqlTranslator::norm_column(c), norm_type))
            .collect();
        let sql = if self.is_sqlite {
            format!("CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY{})", self.shared.table, columns)
        } else {
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id VARCHAR(191) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin PRIMARY KEY{})",
                self.shared.table, columns
            )
        };

        retry("sql_init_schema", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .execute(&self.shared.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        Ok(())
    }

    /// Insert or replace records in multi-row statements.
    pub async fn upsert_batch(&self, records: &[CandidateRecord]) -> Result<usize, StorageError> {
        let mut written = 0;
        for chunk in records.chunks(UPSERT_CHUNK) {
            written += self.upsert_chunk(chunk).await?;
        }
        debug!(written, "Bulk store upsert complete");
        Ok(written)
    }

    async fn upsert_chunk(&self, chunk: &[CandidateRecord]) -> Result<usize, StorageError> {
        if chunk.is_empty() {
            return Ok(0);
        }
        let columns = &self.shared.columns;
        let written: Vec<String> = columns
            .iter()
            .flat_map(|c| [c.clone(), SqlTranslator::norm_column(c)])
            .collect();
        let row_placeholder = format!("({})", vec!["?"; written.len() + 1].join(", "));
        let placeholders = vec![row_placeholder.as_str(); chunk.len()].join(", ");

        let updates: Vec<String> = written
            .iter()
            .map(|c| {
                if self.is_sqlite {
                    format!("{} = excluded.{}", c, c)
                } else {
                    format!("{} = VALUES({})", c, c)
                }
            })
            .collect();
        let conflict = if self.is_sqlite { "ON CONFLICT(id) DO UPDATE SET" } else { "ON DUPLICATE KEY UPDATE" };

        let sql = format!(
            "INSERT INTO {} (id, {}) VALUES {} {} {}",
            self.shared.table,
            written.join(", "),
            placeholders,
            conflict,
            updates.join(", ")
        );

        retry("sql_upsert_batch", &RetryConfig::batch_write(), || {
            let sql = sql.clone();
            async move {
                let mut query = sqlx::query(&sql);
                for record in chunk {
                    query = query.bind(record.id.clone());
                    for column in columns {
                        let value = record.get(column);
                        query = query
                            .bind(value.map(str::to_string))
                            .bind(value.map(normalize));
                    }
                }
                query
                    .execute(&self.shared.pool)
                    .await
                    .map_err(|e| self.shared.map_err(e))
            }
        })
        .await?;

        Ok(chunk.len())
    }
}

struct ScanState {
    shared: Arc<Shared>,
    predicates: Vec<FieldPredicate>,
    logic: CombineLogic,
    after: Option<String>,
    done: bool,
}

async fn next_chunk(mut state: ScanState) -> Result<Option<(Vec<CandidateRecord>, ScanState)>, StorageError> {
    if state.done {
        return Ok(None);
    }
    let size = state.shared.chunk_size;
    let query = SqlTranslator::chunk_query(
        &state.shared.table,
        &state.shared.columns,
        &state.predicates,
        state.logic,
        state.after.as_deref(),
        size,
    );
    let rows = state.shared.fetch(query).await?;
    crate::metrics::record_chunk_rows("bulk", rows.len());

    let records = rows
        .iter()
        .map(|row| state.shared.row_to_record(row))
        .collect::<Result<Vec<_>, _>>()?;

    state.done = records.len() < size;
    let Some(last) = records.last() else {
        return Ok(None);
    };
    state.after = Some(last.id.clone());
    Ok(Some((records, state)))
}

#[async_trait]
impl RecordBackend for SqlStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Bulk
    }

    async fn execute(
        &self,
        predicates: &[FieldPredicate],
        logic: CombineLogic,
    ) -> Result<RecordStream, StorageError> {
        debug!(
            clause = %SqlTranslator::translate_inline(predicates, logic),
            "Bulk scan"
        );
        let state = ScanState {
            shared: Arc::clone(&self.shared),
            predicates: predicates.to_vec(),
            logic,
            after: None,
            done: false,
        };

        // Fetch the first chunk eagerly so connection failures surface here
        let Some((first, state)) = next_chunk(state).await? else {
            return Ok(stream::empty().boxed());
        };
        let rest = stream::try_unfold(state, next_chunk);

        Ok(stream::once(async move { Ok(first) })
            .chain(rest)
            .map_ok(|chunk| stream::iter(chunk.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn count(&self, predicates: &[FieldPredicate], logic: CombineLogic) -> Result<u64, StorageError> {
        let query = SqlTranslator::count_query(&self.shared.table, predicates, logic);
        self.shared.fetch_count(query).await
    }

    async fn get(&self, id: &str) -> Result<Option<CandidateRecord>, StorageError> {
        let query = SqlTranslator::get_query(&self.shared.table, &self.shared.columns, id);
        let rows = self.shared.fetch(query).await?;
        rows.first().map(|row| self.shared.row_to_record(row)).transpose()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.shared.pool)
            .await
            .map(|_| ())
            .map_err(|e| self.shared.map_err(e))
    }

    async fn total_records(&self) -> Result<u64, StorageError> {
        let query = SqlTranslator::count_query(&self.shared.table, &[], CombineLogic::Or);
        self.shared.fetch_count(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::matcher::FieldMatcher;
    use crate::search::MatchType;

    async fn store(dir: &tempfile::TempDir, chunk: usize) -> SqlStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("people.db").display());
        let config = SearchEngineConfig {
            scan_chunk_size: chunk,
            ..Default::default()
        };
        SqlStore::new(&url, &config).await.unwrap()
    }

    fn people() -> Vec<CandidateRecord> {
        (0..7)
            .map(|i| {
                CandidateRecord::new(format!("p{:02}", i))
                    .with("name", if i % 2 == 0 { "Asha Singh" } else { "Meera 100%" })
                    .with("mobile", format!("98765{:05}", i))
            })
            .collect()
    }

    async fn ids(stream: RecordStream) -> Vec<String> {
        stream.map(|r| r.unwrap().id).collect().await
    }

    #[tokio::test]
    async fn test_upsert_and_scan_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 2).await;
        assert_eq!(store.upsert_batch(&people()).await.unwrap(), 7);

        let pred = FieldMatcher::new(["name"]).compile("name", "SINGH", MatchType::Partial).unwrap();
        let got = ids(store.execute(&[pred.clone()], CombineLogic::Or).await.unwrap()).await;
        assert_eq!(got, vec!["p00", "p02", "p04", "p06"]);
        assert_eq!(store.count(&[pred], CombineLogic::Or).await.unwrap(), 4);
        assert_eq!(store.total_records().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_like_wildcards_are_literal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 100).await;
        store.upsert_batch(&people()).await.unwrap();

        let matcher = FieldMatcher::new(["name"]);
        let percent = matcher.compile("name", "100%", MatchType::Partial).unwrap();
        assert_eq!(store.count(&[percent], CombineLogic::Or).await.unwrap(), 3);

        let underscore = matcher.compile("name", "_", MatchType::Partial).unwrap();
        assert_eq!(store.count(&[underscore], CombineLogic::Or).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 100).await;
        store.upsert_batch(&people()).await.unwrap();
        store
            .upsert_batch(&[CandidateRecord::new("p00").with("name", "Renamed")])
            .await
            .unwrap();

        let stream = store.execute(&[], CombineLogic::Or).await.unwrap();
        let records: Vec<CandidateRecord> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(records.len(), 7);
        assert_eq!(records[0].get("name"), Some("Renamed"));
        assert_eq!(records[0].get("mobile"), None);
    }

    #[tokio::test]
    async fn test_comparisons_use_unicode_normalisation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 100).await;
        store
            .upsert_batch(&[
                CandidateRecord::new("u1").with("name", "ÉMILE Zola"),
                CandidateRecord::new("u2").with("name", "Ravi\tSingh\t"),
                CandidateRecord::new("u3").with("name", "\u{3000}Öztürk\n"),
            ])
            .await
            .unwrap();

        let matcher = FieldMatcher::new(["name"]);
        let cases = [
            ("émile", MatchType::Partial, vec!["u1"]),
            ("ravi\tsingh", MatchType::Full, vec!["u2"]),
            ("ÖZTÜRK", MatchType::Full, vec!["u3"]),
        ];
        for (text, match_type, expected) in cases {
            let pred = matcher.compile("name", text, match_type).unwrap();
            let got = ids(store.execute(&[pred.clone()], CombineLogic::Or).await.unwrap()).await;
            assert_eq!(got, expected, "{:?} {}", text, match_type);
            assert_eq!(store.count(&[pred], CombineLogic::Or).await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_get_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 100).await;
        store.upsert_batch(&people()).await.unwrap();

        let found = store.get("p03").await.unwrap().unwrap();
        assert_eq!(found.get("name"), Some("Meera 100%"));
        assert_eq!(found.get("mobile"), Some("9876500003"));
        assert!(store.get("p99").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_error_is_not_an_outage() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 100).await;
        let missing = FieldPredicate {
            field: "nickname".into(),
            comparator: crate::search::matcher::Comparator::Equals,
            value: "x".into(),
        };
        let err = store.count(&[missing], CombineLogic::Or).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert!(!err.is_outage());
    }

    #[tokio::test]
    async fn test_empty_match_is_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 100).await;
        let pred = FieldMatcher::new(["name"]).compile("name", "nobody", MatchType::Full).unwrap();
        assert!(ids(store.execute(&[pred], CombineLogic::Or).await.unwrap()).await.is_empty());
        assert!(store.ping().await.is_ok());
    }
}
