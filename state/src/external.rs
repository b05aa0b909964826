//! External state store forwarding to a Redis server
//!
//! Every key is namespaced with the configured prefix so several logical
//! stores can share one server. `flushdb` only removes keys under this
//! instance's prefix.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, IntoConnectionInfo, RedisResult, Script};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use stowage_core::{
    expiry_seconds, set_ttl, BackendKind, ExternalConfig, Shape, StateBackend, StoreError,
    StoreResult, Ttl,
};
use tracing::{debug, info};

use crate::pool::{map_redis_error, ConnectionPool};
use crate::retry::RetryPolicy;

/// Deletes a key of another type before running the write, so creating
/// writes replace the old shape atomically.
const SHAPED_WRITE: &str = r"
local current = redis.call('TYPE', KEYS[1])['ok']
if current ~= 'none' and current ~= ARGV[1] then
    redis.call('DEL', KEYS[1])
end
return redis.call(ARGV[2], KEYS[1], unpack(ARGV, 3))
";

const SCAN_COUNT: usize = 500;

/// External state store backed by Redis
pub struct ExternalBackend {
    pool: ConnectionPool,
    prefix: String,
    default_ttl: Option<Duration>,
    retry: RetryPolicy,
    shaped_write: Script,
}

impl ExternalBackend {
    /// Build the pool and verify the server answers
    pub async fn connect(config: &ExternalConfig) -> StoreResult<Self> {
        let mut info = (config.host.clone(), config.port)
            .into_connection_info()
            .map_err(map_redis_error)?;
        info.redis.db = config.db_index;
        info.redis.password = config.password.clone();

        let client = Client::open(info).map_err(map_redis_error)?;
        let pool = ConnectionPool::new(
            client,
            config.max_connections,
            config.connect_timeout(),
            config.socket_timeout(),
        );

        let backend = Self {
            pool,
            prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl(),
            retry: RetryPolicy::external(config.max_retries),
            shaped_write: Script::new(SHAPED_WRITE),
        };

        backend
            .exec("ping", "", None, |mut conn| async move {
                let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
                pong
            })
            .await?;

        info!(
            host = %config.host,
            port = config.port,
            db = config.db_index,
            prefix = %config.key_prefix,
            max_connections = config.max_connections,
            "connected to external state store"
        );

        Ok(backend)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Run one command against a pooled connection, retrying connection
    /// failures and turning `WRONGTYPE` replies into `TypeMismatch`.
    async fn exec<T, F, Fut>(
        &self,
        op: &'static str,
        key: &str,
        expected: Option<Shape>,
        f: F,
    ) -> StoreResult<T>
    where
        T: Send,
        F: Fn(MultiplexedConnection) -> Fut + Send + Sync,
        Fut: Future<Output = RedisResult<T>> + Send,
    {
        let this = self;
        let f = &f;
        self.retry
            .run(
                op,
                move || async move {
                    let mut pooled = this.pool.get().await?;
                    match f(pooled.handle()).await {
                        Ok(value) => Ok(value),
                        Err(e) if e.code() == Some("WRONGTYPE") => {
                            let actual = this.shape_of(pooled.handle(), key).await?;
                            match (expected, actual) {
                                (Some(expected), Some(actual)) => {
                                    Err(StoreError::type_mismatch(key, expected, actual))
                                }
                                _ => Err(StoreError::storage(e.to_string())),
                            }
                        }
                        Err(e) => {
                            let err = map_redis_error(e);
                            if err.is_retryable() {
                                pooled.mark_broken();
                            }
                            Err(err)
                        }
                    }
                },
                StoreError::is_retryable,
            )
            .await
    }

    async fn shape_of(&self, mut conn: MultiplexedConnection, key: &str) -> StoreResult<Option<Shape>> {
        let tag: String = redis::cmd("TYPE")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match tag.as_str() {
            "none" => Ok(None),
            other => other.parse().map(Some).map_err(|_| {
                StoreError::storage(format!("key '{}' holds unsupported type '{}'", key, other))
            }),
        }
    }

    /// Creating write of `shape`, replacing a key of any other shape
    async fn shaped_write<T>(
        &self,
        op: &'static str,
        key: &str,
        shape: Shape,
        command: &'static str,
        args: &[&[u8]],
    ) -> StoreResult<T>
    where
        T: redis::FromRedisValue + Send,
    {
        let full = &self.full_key(key);
        let script = &self.shaped_write;
        self.exec(op, key, Some(shape), move |mut conn| async move {
            let mut invocation = script.prepare_invoke();
            invocation.key(full.as_str()).arg(shape.as_str()).arg(command);
            for arg in args {
                invocation.arg(*arg);
            }
            invocation.invoke_async(&mut conn).await
        })
        .await
    }
}

/// Set-membership reads see a key of another shape as an empty set
fn set_view<T: Default>(result: StoreResult<T>) -> StoreResult<T> {
    match result {
        Err(StoreError::TypeMismatch { .. }) => Ok(T::default()),
        other => other,
    }
}

/// Escape glob metacharacters so the prefix matches literally in `SCAN`
fn escape_glob(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl StateBackend for ExternalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    // ============ String ============

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let full = &self.full_key(key);
        self.exec("get", key, Some(Shape::String), move |mut conn| async move {
            conn.get(full).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let ttl = set_ttl(ttl)?.or(self.default_ttl);
        let full = &self.full_key(key);
        self.exec("set", key, None, move |mut conn| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(full).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            cmd.query_async(&mut conn).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let full = &self.full_key(key);
        self.exec("delete", key, None, move |mut conn| async move {
            conn.del(full).await
        })
        .await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let full = &self.full_key(key);
        self.exec("exists", key, None, move |mut conn| async move {
            conn.exists(full).await
        })
        .await
    }

    // ============ Hash ============

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> StoreResult<bool> {
        let added: u64 = self
            .shaped_write("hset", key, Shape::Hash, "HSET", &[field.as_bytes(), value])
            .await?;
        Ok(added > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>> {
        let full = &self.full_key(key);
        self.exec("hget", key, Some(Shape::Hash), move |mut conn| async move {
            conn.hget(full, field).await
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, Vec<u8>>> {
        let full = &self.full_key(key);
        self.exec("hgetall", key, Some(Shape::Hash), move |mut conn| async move {
            conn.hgetall(full).await
        })
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<u64> {
        let full = &self.full_key(key);
        self.exec("hdel", key, Some(Shape::Hash), move |mut conn| async move {
            conn.hdel(full, field).await
        })
        .await
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let full = &self.full_key(key);
        self.exec("hexists", key, Some(Shape::Hash), move |mut conn| async move {
            conn.hexists(full, field).await
        })
        .await
    }

    // ============ List ============

    async fn lpush(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.shaped_write("lpush", key, Shape::List, "LPUSH", &[value])
            .await
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.shaped_write("rpush", key, Shape::List, "RPUSH", &[value])
            .await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>> {
        let full = &self.full_key(key);
        self.exec("lrange", key, Some(Shape::List), move |mut conn| async move {
            redis::cmd("LRANGE")
                .arg(full)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let full = &self.full_key(key);
        self.exec("llen", key, Some(Shape::List), move |mut conn| async move {
            conn.llen(full).await
        })
        .await
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let full = &self.full_key(key);
        self.exec("lpop", key, Some(Shape::List), move |mut conn| async move {
            redis::cmd("LPOP").arg(full).query_async(&mut conn).await
        })
        .await
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let full = &self.full_key(key);
        self.exec("rpop", key, Some(Shape::List), move |mut conn| async move {
            redis::cmd("RPOP").arg(full).query_async(&mut conn).await
        })
        .await
    }

    // ============ Set ============

    async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        if members.is_empty() {
            return Err(StoreError::validation("sadd requires at least one member"));
        }
        let args: Vec<&[u8]> = members.iter().map(|m| m.as_bytes()).collect();
        self.shaped_write("sadd", key, Shape::Set, "SADD", &args)
            .await
    }

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>> {
        let full = &self.full_key(key);
        let result = self
            .exec("smembers", key, Some(Shape::Set), move |mut conn| async move {
                conn.smembers(full).await
            })
            .await;
        set_view(result)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let full = &self.full_key(key);
        let result = self
            .exec("sismember", key, Some(Shape::Set), move |mut conn| async move {
                conn.sismember(full, member).await
            })
            .await;
        set_view(result)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<u64> {
        let full = &self.full_key(key);
        self.exec("srem", key, Some(Shape::Set), move |mut conn| async move {
            conn.srem(full, member).await
        })
        .await
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let full = &self.full_key(key);
        let result = self
            .exec("scard", key, Some(Shape::Set), move |mut conn| async move {
                conn.scard(full).await
            })
            .await;
        set_view(result)
    }

    // ============ Expiry / lifecycle ============

    async fn expire(&self, key: &str, seconds: i64) -> StoreResult<bool> {
        let seconds = expiry_seconds(seconds)?.as_secs();
        let full = &self.full_key(key);
        self.exec("expire", key, None, move |mut conn| async move {
            redis::cmd("EXPIRE")
                .arg(full)
                .arg(seconds)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        let full = &self.full_key(key);
        let code: i64 = self
            .exec("ttl", key, None, move |mut conn| async move {
                redis::cmd("TTL").arg(full).query_async(&mut conn).await
            })
            .await?;
        Ok(Ttl::from_code(code))
    }

    async fn persist(&self, key: &str) -> StoreResult<bool> {
        let full = &self.full_key(key);
        self.exec("persist", key, None, move |mut conn| async move {
            conn.persist(full).await
        })
        .await
    }

    async fn flushdb(&self) -> StoreResult<()> {
        let pattern = &format!("{}*", escape_glob(&self.prefix));
        let removed: u64 = self
            .exec("flushdb", "", None, move |mut conn| async move {
                let mut cursor: u64 = 0;
                let mut removed: u64 = 0;
                loop {
                    let (next, keys): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await?;
                    if !keys.is_empty() {
                        let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                        removed += deleted;
                    }
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Ok(removed)
            })
            .await?;
        info!(prefix = %self.prefix, removed, "flushed external state store namespace");
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close();
        debug!(prefix = %self.prefix, "closed external connection pool");
        Ok(())
    }
}
