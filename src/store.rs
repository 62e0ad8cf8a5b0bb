//! Pooled, retrying SQLite-backed persistent store.
//!
//! Mirrors the reference implementation's `DatabaseManager`: a small pool of
//! pre-configured connections, WAL journaling, and a retry-with-backoff loop
//! around any operation that hits transient contention.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use rusqlite::{Connection, OpenFlags};

use crate::error::StoreError;

pub use rusqlite::types::Value as SqlValue;

/// One result row: column name paired with its dynamically-typed value,
/// in column order.
pub type Row = Vec<(String, SqlValue)>;

const DEFAULT_POOL_SIZE: usize = 5;
const DEFAULT_RETRIES: u32 = 10;
const BASE_RETRY_DELAY: Duration = Duration::from_millis(50);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    body BLOB NOT NULL,
    headers TEXT NOT NULL,
    status INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    ttl_seconds INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry ON cache_entries (created_at, ttl_seconds);
CREATE INDEX IF NOT EXISTS idx_cache_entries_last_accessed ON cache_entries (last_accessed);

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    method TEXT NOT NULL,
    cache_hit INTEGER NOT NULL,
    response_time_ms INTEGER NOT NULL,
    response_size_bytes INTEGER NOT NULL,
    status_code INTEGER NOT NULL DEFAULT 200,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_domain_timestamp ON metrics (domain, timestamp);
";

struct StoreInner {
    idle: Vec<Connection>,
    uri: String,
    is_uri_mode: bool,
    pool_size: usize,
    retries: u32,
}

/// A pooled, retrying handle onto the SQLite-backed persistent store.
///
/// Cheap to clone-by-reference (wrap in `Arc`); internally single mutex
/// guarded, matching the reference implementation's coarse-grained lock.
pub struct Store {
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Opens the store at `database_path`. `":memory:"` opens a private,
    /// process-local in-memory database shared across every pooled
    /// connection via `file::memory:?cache=shared`.
    pub fn open(database_path: &str) -> Result<Self, StoreError> {
        Self::open_with_pool_size(database_path, DEFAULT_POOL_SIZE)
    }

    pub fn open_with_pool_size(
        database_path: &str,
        pool_size: usize,
    ) -> Result<Self, StoreError> {
        let (uri, is_uri_mode) = if database_path == ":memory:" {
            ("file::memory:?cache=shared".to_string(), true)
        } else {
            (database_path.to_string(), false)
        };

        let first = Self::new_connection(&uri, is_uri_mode).map_err(|e| StoreError::Open {
            path: database_path.to_string(),
            source: e,
        })?;
        first.execute_batch(SCHEMA).map_err(|e| StoreError::Open {
            path: database_path.to_string(),
            source: e,
        })?;

        let mut idle = Vec::with_capacity(pool_size);
        idle.push(first);
        for _ in 1..pool_size {
            idle.push(Self::new_connection(&uri, is_uri_mode).map_err(|e| StoreError::Open {
                path: database_path.to_string(),
                source: e,
            })?);
        }

        Ok(Self {
            inner: Mutex::new(StoreInner {
                idle,
                uri,
                is_uri_mode,
                pool_size,
                retries: DEFAULT_RETRIES,
            }),
        })
    }

    fn new_connection(uri: &str, is_uri_mode: bool) -> Result<Connection, rusqlite::Error> {
        let conn = if is_uri_mode {
            Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            Connection::open(uri)?
        };
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", 10_000)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        Ok(conn)
    }

    fn checkout(&self) -> Result<Connection, StoreError> {
        let mut guard = self.inner.lock().expect("store mutex poisoned");
        if let Some(conn) = guard.idle.pop() {
            Ok(conn)
        } else {
            let uri = guard.uri.clone();
            let is_uri_mode = guard.is_uri_mode;
            drop(guard);
            Self::new_connection(&uri, is_uri_mode).map_err(StoreError::Sqlite)
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut guard = self.inner.lock().expect("store mutex poisoned");
        if guard.idle.len() < guard.pool_size {
            guard.idle.push(conn);
        }
        // else: drop closes the connection.
    }

    fn with_retry<T>(
        &self,
        mut op: impl FnMut(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let retries = self.inner.lock().expect("store mutex poisoned").retries;
        let conn = self.checkout()?;
        let mut attempt = 0u32;
        let result = loop {
            match op(&conn) {
                Ok(value) => break Ok(value),
                Err(e) if attempt < retries && is_transient(&e) => {
                    let backoff = BASE_RETRY_DELAY
                        .saturating_mul(1u32 << attempt.min(20))
                        .min(MAX_RETRY_DELAY);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    std::thread::sleep((backoff + jitter).min(MAX_RETRY_DELAY));
                    attempt += 1;
                    continue;
                }
                Err(e) if attempt >= retries && is_transient(&e) => {
                    break Err(StoreError::RetriesExhausted { attempts: attempt });
                }
                Err(e) => break Err(StoreError::Sqlite(e)),
            }
        };
        self.checkin(conn);
        result
    }

    /// Runs a write statement, returning the number of affected rows.
    pub fn update(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StoreError> {
        self.with_retry(|conn| conn.execute(sql, rusqlite::params_from_iter(params.iter())))
    }

    /// Runs a read statement, returning every matching row.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let mut out = Row::with_capacity(column_names.len());
                for (i, name) in column_names.iter().enumerate() {
                    out.push((name.clone(), row.get::<_, SqlValue>(i)?));
                }
                Ok(out)
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
    }

    /// Drains and closes every idle pooled connection.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("store mutex poisoned");
        guard.idle.clear();
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(ffi_err, _)
            if matches!(
                ffi_err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_created_on_open() {
        let store = Store::open(":memory:").unwrap();
        let rows = store
            .query("SELECT name FROM sqlite_master WHERE type='table'", &[])
            .unwrap();
        let names: Vec<String> = rows
            .into_iter()
            .map(|row| match &row[0].1 {
                SqlValue::Text(s) => s.clone(),
                other => panic!("unexpected value: {other:?}"),
            })
            .collect();
        assert!(names.contains(&"cache_entries".to_string()));
        assert!(names.contains(&"metrics".to_string()));
    }

    #[test]
    fn shared_memory_uri_is_visible_across_pooled_connections() {
        let store = Store::open(":memory:").unwrap();
        store
            .update(
                "INSERT INTO cache_entries (key, body, headers, status, created_at, ttl_seconds, last_accessed) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                &[
                    SqlValue::Text("k".into()),
                    SqlValue::Blob(vec![1, 2, 3]),
                    SqlValue::Text("{}".into()),
                    SqlValue::Integer(200),
                    SqlValue::Integer(0),
                    SqlValue::Integer(60),
                    SqlValue::Integer(0),
                ],
            )
            .unwrap();
        // Force a different pooled connection by exhausting and refilling the idle pool.
        let rows = store.query("SELECT key FROM cache_entries", &[]).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn update_reports_affected_row_count() {
        let store = Store::open(":memory:").unwrap();
        let affected = store
            .update(
                "INSERT INTO metrics (domain, method, cache_hit, response_time_ms, response_size_bytes, status_code, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                &[
                    SqlValue::Text("d".into()),
                    SqlValue::Text("GET".into()),
                    SqlValue::Integer(0),
                    SqlValue::Integer(12),
                    SqlValue::Integer(34),
                    SqlValue::Integer(200),
                    SqlValue::Integer(0),
                ],
            )
            .unwrap();
        assert_eq!(affected, 1);
    }
}
