//! State manager facade
//!
//! Builds exactly one backend from a `StoreConfig`, forwards every
//! operation to it and owns the expiry sweeper's lifecycle.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{BackendKind, StateBackend, StoreConfig, StoreError, StoreResult, Ttl};
use tracing::{debug, info, warn};

use crate::embedded::EmbeddedBackend;
use crate::external::ExternalBackend;
use crate::sweeper::Sweeper;

/// Build the backend selected by `config.backend`
pub async fn create_backend(config: &StoreConfig) -> StoreResult<Arc<dyn StateBackend>> {
    config.validate()?;
    let backend: Arc<dyn StateBackend> = match config.backend {
        BackendKind::Embedded => Arc::new(EmbeddedBackend::open(&config.embedded)?),
        BackendKind::External => Arc::new(ExternalBackend::connect(&config.external).await?),
    };
    Ok(backend)
}

/// Single entry point over whichever backend the configuration selects
pub struct StateManager {
    config: StoreConfig,
    backend: Arc<dyn StateBackend>,
    sweeper: Mutex<Option<Sweeper>>,
    closed: AtomicBool,
}

impl StateManager {
    /// Validate `config`, build its backend and start the sweeper if enabled
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        let backend = create_backend(&config).await?;

        let sweeper = match config.backend {
            BackendKind::Embedded if config.embedded.auto_cleanup_enabled => Some(Sweeper::spawn(
                backend.clone(),
                config.embedded.cleanup_interval(),
                config.embedded.cleanup_batch_size,
            )),
            _ => None,
        };

        info!(backend = %config.backend, sweeper = sweeper.is_some(), "state manager ready");

        Ok(Self {
            config,
            backend,
            sweeper: Mutex::new(sweeper),
            closed: AtomicBool::new(false),
        })
    }

    /// Open a manager, run `f` with it and close it whatever `f` returns
    pub async fn scoped<F, Fut, T>(config: StoreConfig, f: F) -> StoreResult<T>
    where
        F: FnOnce(Arc<StateManager>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let manager = Arc::new(Self::open(config).await?);
        let result = f(manager.clone()).await;
        let closed = manager.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!("close after failed scope also failed: {}", close_err);
                Err(e)
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|sweeper| sweeper.is_running())
    }

    fn backend(&self) -> StoreResult<&dyn StateBackend> {
        if self.is_closed() {
            return Err(StoreError::storage("store is closed"));
        }
        Ok(self.backend.as_ref())
    }

    // ============ String ============

    pub async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.backend()?.get(key).await
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.backend()?.set(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<u64> {
        self.backend()?.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.backend()?.exists(key).await
    }

    // ============ Hash ============

    pub async fn hset(&self, key: &str, field: &str, value: &[u8]) -> StoreResult<bool> {
        self.backend()?.hset(key, field, value).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>> {
        self.backend()?.hget(key, field).await
    }

    pub async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, Vec<u8>>> {
        self.backend()?.hgetall(key).await
    }

    pub async fn hdel(&self, key: &str, field: &str) -> StoreResult<u64> {
        self.backend()?.hdel(key, field).await
    }

    pub async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.backend()?.hexists(key, field).await
    }

    // ============ List ============

    pub async fn lpush(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.backend()?.lpush(key, value).await
    }

    pub async fn rpush(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.backend()?.rpush(key, value).await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>> {
        self.backend()?.lrange(key, start, stop).await
    }

    pub async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.backend()?.llen(key).await
    }

    pub async fn lpop(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.backend()?.lpop(key).await
    }

    pub async fn rpop(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.backend()?.rpop(key).await
    }

    // ============ Set ============

    pub async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        self.backend()?.sadd(key, members).await
    }

    pub async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>> {
        self.backend()?.smembers(key).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.backend()?.sismember(key, member).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> StoreResult<u64> {
        self.backend()?.srem(key, member).await
    }

    pub async fn scard(&self, key: &str) -> StoreResult<u64> {
        self.backend()?.scard(key).await
    }

    // ============ Expiry / lifecycle ============

    pub async fn expire(&self, key: &str, seconds: i64) -> StoreResult<bool> {
        self.backend()?.expire(key, seconds).await
    }

    pub async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        self.backend()?.ttl(key).await
    }

    pub async fn persist(&self, key: &str) -> StoreResult<bool> {
        self.backend()?.persist(key).await
    }

    pub async fn flushdb(&self) -> StoreResult<()> {
        let backend = self.backend()?;
        backend.flushdb().await?;
        info!(backend = %self.config.backend, "flushed state store");
        Ok(())
    }

    /// Run one sweep now instead of waiting for the sweeper
    pub async fn purge_expired(&self) -> StoreResult<u64> {
        let removed = self
            .backend()?
            .purge_expired(self.config.embedded.cleanup_batch_size)
            .await?;
        debug!(removed, "manual expiry sweep");
        Ok(removed)
    }

    /// Stop the sweeper and release the backend; later calls are no-ops
    pub async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
        self.backend.close().await?;
        info!(backend = %self.config.backend, "state manager closed");
        Ok(())
    }
}

impl Drop for StateManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            debug!("state manager dropped without close, stopping sweeper");
            drop(sweeper);
        }
    }
}
