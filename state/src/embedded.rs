//! Embedded state store backed by a single SQLite file
//!
//! Key metadata lives in `keys`; each shape has its own payload table whose
//! rows cascade away when the key row is deleted. Every call runs in one
//! transaction, so a crash can never leave a key in a mixed-shape state.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{
    expiry_seconds, set_ttl, BackendKind, EmbeddedConfig, Shape, StateBackend, StoreError,
    StoreResult, Timestamp, Ttl,
};
use tracing::{debug, info};

use crate::retry::RetryPolicy;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS keys (
    key       TEXT PRIMARY KEY,
    shape     TEXT NOT NULL,
    expire_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_keys_expire_at ON keys(expire_at) WHERE expire_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS string_values (
    key   TEXT PRIMARY KEY REFERENCES keys(key) ON DELETE CASCADE,
    value BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS hash_values (
    key   TEXT NOT NULL REFERENCES keys(key) ON DELETE CASCADE,
    field TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (key, field)
);

CREATE TABLE IF NOT EXISTS list_values (
    key   TEXT NOT NULL REFERENCES keys(key) ON DELETE CASCADE,
    seq   INTEGER NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (key, seq)
);

CREATE TABLE IF NOT EXISTS set_values (
    key    TEXT NOT NULL REFERENCES keys(key) ON DELETE CASCADE,
    member TEXT NOT NULL,
    PRIMARY KEY (key, member)
);
";

/// Whether a call may write; reads start deferred so readers don't queue
/// behind each other, and only take the write lock when lazy expiry deletes.
#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

/// Failure inside a transaction closure
#[derive(Debug)]
enum EngineError {
    Sqlite(rusqlite::Error),
    Store(StoreError),
}

impl EngineError {
    fn is_busy(&self) -> bool {
        match self {
            EngineError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
            ),
            EngineError::Store(_) => false,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Sqlite(e) => write!(f, "{}", e),
            EngineError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Sqlite(err)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Store(err)
    }
}

impl From<EngineError> for StoreError {
    fn from(err: EngineError) -> Self {
        let busy = err.is_busy();
        match err {
            EngineError::Store(e) => e,
            EngineError::Sqlite(e) if busy => {
                StoreError::storage(format!("database is locked, retries exhausted: {}", e))
            }
            EngineError::Sqlite(e) => StoreError::storage(e.to_string()),
        }
    }
}

type EngineResult<T> = Result<T, EngineError>;

/// Embedded state store backed by SQLite
#[derive(Clone)]
pub struct EmbeddedBackend {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
    retry: RetryPolicy,
}

impl EmbeddedBackend {
    /// Open or create the data file described by `config`
    pub fn open(config: &EmbeddedConfig) -> StoreResult<Self> {
        let path = config.path.clone();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path).map_err(storage_error)?;
        conn.busy_timeout(config.busy_timeout())
            .map_err(storage_error)?;

        let journal = if config.wal_enabled {
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;"
        } else {
            "PRAGMA journal_mode = DELETE;
             PRAGMA synchronous = FULL;"
        };
        conn.execute_batch(journal).map_err(storage_error)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage_error)?;
        conn.execute_batch(SCHEMA).map_err(storage_error)?;

        info!(path = %path.display(), wal = config.wal_enabled, "opened embedded state store");

        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(Some(conn)),
                path,
                retry: RetryPolicy::embedded(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run `f` inside one transaction on the blocking pool
    ///
    /// Busy/locked errors roll the transaction back and retry the whole
    /// closure with backoff; anything else surfaces immediately.
    async fn call<T, F>(&self, op: &'static str, access: Access, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: Fn(&Connection, i64) -> EngineResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = inner.conn.lock();
            let conn = guard
                .as_mut()
                .ok_or_else(|| EngineError::Store(StoreError::storage("store is closed")))?;

            let behavior = match access {
                Access::Read => TransactionBehavior::Deferred,
                Access::Write => TransactionBehavior::Immediate,
            };

            inner.retry.run_blocking(
                op,
                || {
                    let tx = conn.transaction_with_behavior(behavior)?;
                    let out = f(&tx, Timestamp::now().as_millis())?;
                    tx.commit()?;
                    Ok(out)
                },
                EngineError::is_busy,
            )
        })
        .await
        .map_err(|e| StoreError::storage(format!("blocking task failed: {}", e)))?;

        result.map_err(StoreError::from)
    }
}

fn storage_error(err: rusqlite::Error) -> StoreError {
    StoreError::storage(err.to_string())
}

// ============ Key metadata helpers ============

/// Shape and deadline of a live key; an expired key is deleted on the spot
fn live_entry(conn: &Connection, key: &str, now: i64) -> EngineResult<Option<(Shape, Option<i64>)>> {
    let row: Option<(String, Option<i64>)> = conn
        .query_row(
            "SELECT shape, expire_at FROM keys WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((_, Some(expire_at))) if expire_at <= now => {
            delete_key(conn, key)?;
            debug!(key, "lazily expired key");
            Ok(None)
        }
        Some((shape, expire_at)) => Ok(Some((shape.parse()?, expire_at))),
    }
}

fn live_shape(conn: &Connection, key: &str, now: i64) -> EngineResult<Option<Shape>> {
    Ok(live_entry(conn, key, now)?.map(|(shape, _)| shape))
}

/// True when the key holds `expected`, false when absent, mismatch otherwise
fn expect_shape(conn: &Connection, key: &str, expected: Shape, now: i64) -> EngineResult<bool> {
    match live_shape(conn, key, now)? {
        None => Ok(false),
        Some(actual) if actual == expected => Ok(true),
        Some(actual) => Err(StoreError::type_mismatch(key, expected, actual).into()),
    }
}

/// True only when the key is live and holds `shape`
///
/// Set-membership reads use this: a key of another shape has no members.
fn holds_shape(conn: &Connection, key: &str, shape: Shape, now: i64) -> EngineResult<bool> {
    Ok(live_shape(conn, key, now)? == Some(shape))
}

/// Make `key` hold `shape`, destroying a key of any other shape first
fn claim_key(conn: &Connection, key: &str, shape: Shape, now: i64) -> EngineResult<()> {
    match live_shape(conn, key, now)? {
        Some(actual) if actual == shape => return Ok(()),
        Some(actual) => {
            debug!(key, from = %actual, to = %shape, "shape switch");
            delete_key(conn, key)?;
        }
        None => {}
    }
    conn.execute(
        "INSERT INTO keys (key, shape, expire_at) VALUES (?1, ?2, NULL)",
        params![key, shape.as_str()],
    )?;
    Ok(())
}

fn delete_key(conn: &Connection, key: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM keys WHERE key = ?1", params![key])
}

/// Collections never linger empty
fn drop_if_empty(conn: &Connection, key: &str, table: &str) -> EngineResult<()> {
    let remaining: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE key = ?1", table),
        params![key],
        |row| row.get(0),
    )?;
    if remaining == 0 {
        delete_key(conn, key)?;
    }
    Ok(())
}

fn count_rows(conn: &Connection, key: &str, table: &str) -> EngineResult<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE key = ?1", table),
        params![key],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Resolve inclusive, possibly negative indices to `(offset, count)`
pub(crate) fn normalize_range(len: u64, start: i64, stop: i64) -> Option<(u64, u64)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as u64, (stop - start + 1) as u64))
}

fn pop_edge(conn: &Connection, key: &str, now: i64, head: bool) -> EngineResult<Option<Vec<u8>>> {
    if !expect_shape(conn, key, Shape::List, now)? {
        return Ok(None);
    }
    let sql = if head {
        "SELECT seq, value FROM list_values WHERE key = ?1 ORDER BY seq ASC LIMIT 1"
    } else {
        "SELECT seq, value FROM list_values WHERE key = ?1 ORDER BY seq DESC LIMIT 1"
    };
    let row: Option<(i64, Vec<u8>)> = conn
        .query_row(sql, params![key], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;

    let Some((seq, value)) = row else {
        return Ok(None);
    };
    conn.execute(
        "DELETE FROM list_values WHERE key = ?1 AND seq = ?2",
        params![key, seq],
    )?;
    drop_if_empty(conn, key, "list_values")?;
    Ok(Some(value))
}

fn push_edge(conn: &Connection, key: &str, value: &[u8], now: i64, head: bool) -> EngineResult<u64> {
    claim_key(conn, key, Shape::List, now)?;
    // Head pushes walk the sequence down, tail pushes walk it up, so
    // existing rows are never renumbered.
    let sql = if head {
        "SELECT MIN(seq) - 1 FROM list_values WHERE key = ?1"
    } else {
        "SELECT MAX(seq) + 1 FROM list_values WHERE key = ?1"
    };
    let seq: Option<i64> = conn.query_row(sql, params![key], |row| row.get(0))?;
    conn.execute(
        "INSERT INTO list_values (key, seq, value) VALUES (?1, ?2, ?3)",
        params![key, seq.unwrap_or(0), value],
    )?;
    count_rows(conn, key, "list_values")
}

#[async_trait]
impl StateBackend for EmbeddedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    // ============ String ============

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.call("get", Access::Read, move |conn, now| {
            if !expect_shape(conn, &key, Shape::String, now)? {
                return Ok(None);
            }
            let value = conn
                .query_row(
                    "SELECT value FROM string_values WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let ttl = set_ttl(ttl)?;
        let key = key.to_string();
        let value = value.to_vec();
        self.call("set", Access::Write, move |conn, now| {
            claim_key(conn, &key, Shape::String, now)?;
            conn.execute(
                "INSERT INTO string_values (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            let expire_at = ttl.map(|d| Timestamp::from_millis(now).plus(d).as_millis());
            conn.execute(
                "UPDATE keys SET expire_at = ?1 WHERE key = ?2",
                params![expire_at, key],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let key = key.to_string();
        self.call("delete", Access::Write, move |conn, now| {
            if live_shape(conn, &key, now)?.is_none() {
                return Ok(0);
            }
            Ok(delete_key(conn, &key)? as u64)
        })
        .await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.call("exists", Access::Read, move |conn, now| {
            Ok(live_shape(conn, &key, now)?.is_some())
        })
        .await
    }

    // ============ Hash ============

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> StoreResult<bool> {
        let key = key.to_string();
        let field = field.to_string();
        let value = value.to_vec();
        self.call("hset", Access::Write, move |conn, now| {
            claim_key(conn, &key, Shape::Hash, now)?;
            let existed = conn
                .query_row(
                    "SELECT 1 FROM hash_values WHERE key = ?1 AND field = ?2",
                    params![key, field],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            conn.execute(
                "INSERT INTO hash_values (key, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                params![key, field, value],
            )?;
            Ok(!existed)
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = key.to_string();
        let field = field.to_string();
        self.call("hget", Access::Read, move |conn, now| {
            if !expect_shape(conn, &key, Shape::Hash, now)? {
                return Ok(None);
            }
            let value = conn
                .query_row(
                    "SELECT value FROM hash_values WHERE key = ?1 AND field = ?2",
                    params![key, field],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, Vec<u8>>> {
        let key = key.to_string();
        self.call("hgetall", Access::Read, move |conn, now| {
            let mut fields = HashMap::new();
            if !expect_shape(conn, &key, Shape::Hash, now)? {
                return Ok(fields);
            }
            let mut stmt = conn.prepare("SELECT field, value FROM hash_values WHERE key = ?1")?;
            let rows = stmt.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                let (field, value): (String, Vec<u8>) = row?;
                fields.insert(field, value);
            }
            Ok(fields)
        })
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<u64> {
        let key = key.to_string();
        let field = field.to_string();
        self.call("hdel", Access::Write, move |conn, now| {
            if !expect_shape(conn, &key, Shape::Hash, now)? {
                return Ok(0);
            }
            let removed = conn.execute(
                "DELETE FROM hash_values WHERE key = ?1 AND field = ?2",
                params![key, field],
            )?;
            drop_if_empty(conn, &key, "hash_values")?;
            Ok(removed as u64)
        })
        .await
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let key = key.to_string();
        let field = field.to_string();
        self.call("hexists", Access::Read, move |conn, now| {
            if !expect_shape(conn, &key, Shape::Hash, now)? {
                return Ok(false);
            }
            let found = conn
                .query_row(
                    "SELECT 1 FROM hash_values WHERE key = ?1 AND field = ?2",
                    params![key, field],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    // ============ List ============

    async fn lpush(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        let key = key.to_string();
        let value = value.to_vec();
        self.call("lpush", Access::Write, move |conn, now| {
            push_edge(conn, &key, &value, now, true)
        })
        .await
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        let key = key.to_string();
        let value = value.to_vec();
        self.call("rpush", Access::Write, move |conn, now| {
            push_edge(conn, &key, &value, now, false)
        })
        .await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>> {
        let key = key.to_string();
        self.call("lrange", Access::Read, move |conn, now| {
            if !expect_shape(conn, &key, Shape::List, now)? {
                return Ok(Vec::new());
            }
            let len = count_rows(conn, &key, "list_values")?;
            let Some((offset, count)) = normalize_range(len, start, stop) else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(
                "SELECT value FROM list_values WHERE key = ?1
                 ORDER BY seq ASC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![key, count as i64, offset as i64], |row| row.get(0))?;
            let mut values = Vec::with_capacity(count as usize);
            for row in rows {
                values.push(row?);
            }
            Ok(values)
        })
        .await
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let key = key.to_string();
        self.call("llen", Access::Read, move |conn, now| {
            if !expect_shape(conn, &key, Shape::List, now)? {
                return Ok(0);
            }
            count_rows(conn, &key, "list_values")
        })
        .await
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.call("lpop", Access::Write, move |conn, now| pop_edge(conn, &key, now, true))
            .await
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.call("rpop", Access::Write, move |conn, now| pop_edge(conn, &key, now, false))
            .await
    }

    // ============ Set ============

    async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        if members.is_empty() {
            return Err(StoreError::validation("sadd requires at least one member"));
        }
        let key = key.to_string();
        let members = members.to_vec();
        self.call("sadd", Access::Write, move |conn, now| {
            claim_key(conn, &key, Shape::Set, now)?;
            let mut stmt =
                conn.prepare("INSERT OR IGNORE INTO set_values (key, member) VALUES (?1, ?2)")?;
            let mut added = 0u64;
            for member in &members {
                added += stmt.execute(params![key, member])? as u64;
            }
            Ok(added)
        })
        .await
    }

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>> {
        let key = key.to_string();
        self.call("smembers", Access::Read, move |conn, now| {
            let mut members = HashSet::new();
            if !holds_shape(conn, &key, Shape::Set, now)? {
                return Ok(members);
            }
            let mut stmt = conn.prepare("SELECT member FROM set_values WHERE key = ?1")?;
            let rows = stmt.query_map(params![key], |row| row.get(0))?;
            for row in rows {
                members.insert(row?);
            }
            Ok(members)
        })
        .await
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let key = key.to_string();
        let member = member.to_string();
        self.call("sismember", Access::Read, move |conn, now| {
            if !holds_shape(conn, &key, Shape::Set, now)? {
                return Ok(false);
            }
            let found = conn
                .query_row(
                    "SELECT 1 FROM set_values WHERE key = ?1 AND member = ?2",
                    params![key, member],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<u64> {
        let key = key.to_string();
        let member = member.to_string();
        self.call("srem", Access::Write, move |conn, now| {
            if !expect_shape(conn, &key, Shape::Set, now)? {
                return Ok(0);
            }
            let removed = conn.execute(
                "DELETE FROM set_values WHERE key = ?1 AND member = ?2",
                params![key, member],
            )?;
            drop_if_empty(conn, &key, "set_values")?;
            Ok(removed as u64)
        })
        .await
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let key = key.to_string();
        self.call("scard", Access::Read, move |conn, now| {
            if !holds_shape(conn, &key, Shape::Set, now)? {
                return Ok(0);
            }
            count_rows(conn, &key, "set_values")
        })
        .await
    }

    // ============ Expiry / lifecycle ============

    async fn expire(&self, key: &str, seconds: i64) -> StoreResult<bool> {
        let ttl = expiry_seconds(seconds)?;
        let key = key.to_string();
        self.call("expire", Access::Write, move |conn, now| {
            if live_shape(conn, &key, now)?.is_none() {
                return Ok(false);
            }
            if ttl.is_zero() {
                delete_key(conn, &key)?;
                return Ok(true);
            }
            let expire_at = Timestamp::from_millis(now).plus(ttl).as_millis();
            conn.execute(
                "UPDATE keys SET expire_at = ?1 WHERE key = ?2",
                params![expire_at, key],
            )?;
            Ok(true)
        })
        .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        let key = key.to_string();
        self.call("ttl", Access::Read, move |conn, now| {
            Ok(match live_entry(conn, &key, now)? {
                None => Ttl::Missing,
                Some((_, None)) => Ttl::NoExpiry,
                Some((_, Some(expire_at))) => Ttl::from_remaining_millis(expire_at - now),
            })
        })
        .await
    }

    async fn persist(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.call("persist", Access::Write, move |conn, now| {
            match live_entry(conn, &key, now)? {
                Some((_, Some(_))) => {
                    conn.execute("UPDATE keys SET expire_at = NULL WHERE key = ?1", params![key])?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    async fn flushdb(&self) -> StoreResult<()> {
        let removed = self
            .call("flushdb", Access::Write, |conn, _| {
                Ok(conn.execute("DELETE FROM keys", [])?)
            })
            .await?;
        info!(removed, "flushed embedded state store");
        Ok(())
    }

    async fn purge_expired(&self, batch_size: usize) -> StoreResult<u64> {
        let batch_size = batch_size.max(1) as i64;
        let mut total = 0u64;
        // One transaction per batch keeps the write lock short.
        loop {
            let removed = self
                .call("purge_expired", Access::Write, move |conn, now| {
                    let removed = conn.execute(
                        "DELETE FROM keys WHERE key IN (
                             SELECT key FROM keys
                             WHERE expire_at IS NOT NULL AND expire_at <= ?1
                             LIMIT ?2
                         )",
                        params![now, batch_size],
                    )?;
                    Ok(removed as u64)
                })
                .await?;
            total += removed;
            if (removed as i64) < batch_size {
                break;
            }
        }
        if total > 0 {
            debug!(total, "purged expired keys");
        }
        Ok(total)
    }

    async fn close(&self) -> StoreResult<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(conn) = inner.conn.lock().take() {
                conn.close().map_err(|(_, e)| storage_error(e))?;
                info!(path = %inner.path.display(), "closed embedded state store");
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage(format!("blocking task failed: {}", e)))?
    }
}

/// Remove the data file together with its `-wal` and `-shm` companions
pub fn remove_database_files<P: AsRef<Path>>(path: P) -> StoreResult<()> {
    let path = path.as_ref();
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut companion = path.as_os_str().to_owned();
        companion.push(suffix);
        candidates.push(PathBuf::from(companion));
    }

    for file in candidates {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(file = %file.display(), "removed database file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> EmbeddedBackend {
        let config = EmbeddedConfig {
            path: tmp.path().join("state.db"),
            ..EmbeddedConfig::default()
        };
        EmbeddedBackend::open(&config).unwrap()
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(normalize_range(3, 0, -1), Some((0, 3)));
        assert_eq!(normalize_range(3, -2, -1), Some((1, 2)));
        assert_eq!(normalize_range(3, 1, 100), Some((1, 2)));
        assert_eq!(normalize_range(3, -100, 0), Some((0, 1)));
        assert_eq!(normalize_range(3, 2, 1), None);
        assert_eq!(normalize_range(3, 5, 10), None);
        assert_eq!(normalize_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn test_embedded_store_basic() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store.set("key1", b"value1", None).await.unwrap();
        assert_eq!(store.get("key1").await.unwrap(), Some(b"value1".to_vec()));
        assert!(store.exists("key1").await.unwrap());

        assert_eq!(store.delete("key1").await.unwrap(), 1);
        assert_eq!(store.delete("key1").await.unwrap(), 0);
        assert_eq!(store.get("key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_embedded_store_reopen() {
        let tmp = TempDir::new().unwrap();

        {
            let store = open_store(&tmp);
            store.set("greeting", b"hello", None).await.unwrap();
            store.rpush("queue", b"a").await.unwrap();
            store.close().await.unwrap();
        }

        {
            let store = open_store(&tmp);
            assert_eq!(store.get("greeting").await.unwrap(), Some(b"hello".to_vec()));
            assert_eq!(store.llen("queue").await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_list_edges() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        assert_eq!(store.rpush("l", b"1").await.unwrap(), 1);
        assert_eq!(store.rpush("l", b"2").await.unwrap(), 2);
        assert_eq!(store.lpush("l", b"0").await.unwrap(), 3);
        assert_eq!(
            store.lrange("l", 0, -1).await.unwrap(),
            vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]
        );
        assert_eq!(store.lrange("l", -2, -1).await.unwrap(), vec![b"1".to_vec(), b"2".to_vec()]);

        assert_eq!(store.lpop("l").await.unwrap(), Some(b"0".to_vec()));
        assert_eq!(store.rpop("l").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.rpop("l").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.rpop("l").await.unwrap(), None);
        assert!(!store.exists("l").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_fields() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        assert!(store.hset("h", "f", b"a").await.unwrap());
        assert!(!store.hset("h", "f", b"b").await.unwrap());
        assert_eq!(store.hget("h", "f").await.unwrap(), Some(b"b".to_vec()));
        assert!(store.hexists("h", "f").await.unwrap());
        assert!(!store.hexists("h", "g").await.unwrap());

        assert_eq!(store.hdel("h", "g").await.unwrap(), 0);
        assert_eq!(store.hdel("h", "f").await.unwrap(), 1);
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_members() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let added = store
            .sadd("s", &["x".to_string(), "y".to_string(), "x".to_string()])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(store.sadd("s", &["x".to_string()]).await.unwrap(), 0);
        assert_eq!(store.scard("s").await.unwrap(), 2);
        assert!(store.sismember("s", "y").await.unwrap());
        assert_eq!(store.srem("s", "missing").await.unwrap(), 0);
        assert_eq!(store.srem("s", "y").await.unwrap(), 1);

        let err = store.sadd("s", &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_wrong_shape_reads_fail() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store.rpush("jobs", b"1").await.unwrap();
        let err = store.hget("jobs", "f").await.unwrap_err();
        assert_eq!(err, StoreError::type_mismatch("jobs", Shape::Hash, Shape::List));
        assert!(store.get("jobs").await.unwrap_err().is_type_mismatch());
        assert!(store.srem("jobs", "1").await.unwrap_err().is_type_mismatch());

        // set-membership reads see a list as an empty set
        assert_eq!(store.scard("jobs").await.unwrap(), 0);
        assert!(!store.sismember("jobs", "1").await.unwrap());
        assert!(store.smembers("jobs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shape_switch_drops_old_payload() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store.sadd("k", &["m".to_string()]).await.unwrap();
        store.expire("k", 100).await.unwrap();
        store.set("k", b"v", None).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.smembers("k").await.unwrap().is_empty());
        assert_eq!(store.ttl("k").await.unwrap(), Ttl::NoExpiry);

        store.hset("k", "f", b"1").await.unwrap();
        assert!(store.get("k").await.unwrap_err().is_type_mismatch());
        assert_eq!(store.hgetall("k").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        assert_eq!(store.ttl("k").await.unwrap(), Ttl::Missing);
        assert!(!store.expire("k", 10).await.unwrap());

        store.set("k", b"v", Some(Duration::from_secs(100))).await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), Ttl::Remaining(100));

        assert!(store.persist("k").await.unwrap());
        assert!(!store.persist("k").await.unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), Ttl::NoExpiry);

        assert!(matches!(
            store.expire("k", -1).await.unwrap_err(),
            StoreError::Validation(_)
        ));
        assert!(store.expire("k", 0).await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store.set("k", b"v", Some(Duration::from_millis(50))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), Ttl::Missing);
        // expired keys can be recreated under any shape
        store.rpush("k", b"x").await.unwrap();
        assert_eq!(store.llen("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_in_batches() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        for i in 0..7 {
            store
                .set(&format!("temp:{i}"), b"gone", Some(Duration::from_millis(20)))
                .await
                .unwrap();
        }
        store.set("keep", b"stay", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.purge_expired(3).await.unwrap(), 7);
        assert_eq!(store.purge_expired(3).await.unwrap(), 0);
        assert!(store.exists("keep").await.unwrap());
    }

    #[tokio::test]
    async fn test_flushdb_and_close() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store.set("a", b"1", None).await.unwrap();
        store.hset("b", "f", b"2").await.unwrap();
        store.flushdb().await.unwrap();
        assert!(!store.exists("a").await.unwrap());
        assert!(store.hgetall("b").await.unwrap().is_empty());

        store.close().await.unwrap();
        assert!(matches!(
            store.get("a").await.unwrap_err(),
            StoreError::Storage(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_database_files() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.set("a", b"1", None).await.unwrap();
        store.close().await.unwrap();

        let path = tmp.path().join("state.db");
        assert!(path.exists());
        remove_database_files(&path).unwrap();
        assert!(!path.exists());
        assert!(!tmp.path().join("state.db-wal").exists());
        assert!(!tmp.path().join("state.db-shm").exists());
        // removing twice is fine
        remove_database_files(&path).unwrap();
    }
}
