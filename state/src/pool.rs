//! Bounded pool of multiplexed Redis connections

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stowage_core::{StoreError, StoreResult};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

/// Map a client error onto the shared taxonomy
///
/// `WRONGTYPE` replies are handled by the caller, which knows the key.
pub(crate) fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_timeout()
        || err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        StoreError::connection(err.to_string())
    } else if err.kind() == redis::ErrorKind::AuthenticationFailed {
        StoreError::connection(format!("authentication failed: {}", err))
    } else {
        StoreError::storage(err.to_string())
    }
}

/// Pool with at most `max_connections` connections checked out at once
pub struct ConnectionPool {
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Semaphore,
    connect_timeout: Duration,
    socket_timeout: Duration,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        client: Client,
        max_connections: usize,
        connect_timeout: Duration,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            client,
            idle: Mutex::new(Vec::with_capacity(max_connections)),
            permits: Semaphore::new(max_connections),
            connect_timeout,
            socket_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Check out a connection, waiting at most the connect timeout for a slot
    pub async fn get(&self) -> StoreResult<PooledConnection<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::storage("store is closed"));
        }

        let permit = match tokio::time::timeout(self.connect_timeout, self.permits.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(StoreError::storage("store is closed")),
            Err(_) => {
                return Err(StoreError::connection(format!(
                    "no pooled connection available within {:?}",
                    self.connect_timeout
                )))
            }
        };

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                debug!("opening pooled connection");
                self.client
                    .get_multiplexed_async_connection_with_timeouts(
                        self.socket_timeout,
                        self.connect_timeout,
                    )
                    .await
                    .map_err(map_redis_error)?
            }
        };

        Ok(PooledConnection {
            conn,
            pool: self,
            broken: false,
            _permit: permit,
        })
    }

    /// Drop idle connections and refuse further checkouts
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.idle.lock().clear();
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    #[cfg(test)]
    fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A checked-out connection; returns to the pool on drop unless broken
pub struct PooledConnection<'a> {
    conn: MultiplexedConnection,
    pool: &'a ConnectionPool,
    broken: bool,
    _permit: SemaphorePermit<'a>,
}

impl PooledConnection<'_> {
    /// Handle for one command; multiplexed connections are cheap to clone
    pub fn handle(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Discard instead of recycling, after an I/O failure
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if !self.broken && !self.pool.closed.load(Ordering::Acquire) {
            self.pool.idle.lock().push(self.conn.clone());
        }
    }
}
