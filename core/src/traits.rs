//! Core traits defining Stowage interfaces
//!
//! `StateBackend` is the capability contract both storage engines implement
//! identically. Absence of a key, field or member is a normal return value;
//! only genuine failures produce a `StoreError`.

use crate::config::BackendKind;
use crate::types::Ttl;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Result type for Stowage operations
pub type StoreResult<T> = Result<T, crate::error::StoreError>;

/// Storage engine contract
///
/// Every mutating call is atomic with respect to itself. Creating writes
/// (`set`, `hset`, `lpush`, `rpush`, `sadd`) replace a key of another shape.
/// Set-membership reads (`smembers`, `sismember`, `scard`) see a key of
/// another shape as an empty set; every other operation fails with
/// `TypeMismatch` on the wrong shape.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Which engine answers this backend's calls
    fn kind(&self) -> BackendKind;

    // ============ String ============

    /// Get a plain value
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Store a plain value, optionally with a TTL
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key of any shape, returning the number of keys removed
    async fn delete(&self, key: &str) -> StoreResult<u64>;

    /// Check if a key of any shape exists
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    // ============ Hash ============

    /// Set a hash field, returning true when the field is new
    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> StoreResult<bool>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, Vec<u8>>>;

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<u64>;

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool>;

    // ============ List ============

    /// Prepend a value, returning the new length
    async fn lpush(&self, key: &str, value: &[u8]) -> StoreResult<u64>;

    /// Append a value, returning the new length
    async fn rpush(&self, key: &str, value: &[u8]) -> StoreResult<u64>;

    /// Inclusive range read; negative indices count from the tail
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>>;

    async fn llen(&self, key: &str) -> StoreResult<u64>;

    async fn lpop(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn rpop(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    // ============ Set ============

    /// Add members atomically, returning how many were not already present
    async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<u64>;

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>>;

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> StoreResult<u64>;

    async fn scard(&self, key: &str) -> StoreResult<u64>;

    // ============ Expiry / lifecycle ============

    /// Set a TTL in seconds; false when the key does not exist
    async fn expire(&self, key: &str, seconds: i64) -> StoreResult<bool>;

    async fn ttl(&self, key: &str) -> StoreResult<Ttl>;

    /// Remove a TTL; false when the key is missing or had none
    async fn persist(&self, key: &str) -> StoreResult<bool>;

    /// Remove every key this backend instance owns
    async fn flushdb(&self) -> StoreResult<()>;

    /// Eagerly delete expired keys, at most `batch_size` per transaction
    async fn purge_expired(&self, batch_size: usize) -> StoreResult<u64> {
        let _ = batch_size;
        Ok(0)
    }

    /// Release the underlying file handle or connection pool
    async fn close(&self) -> StoreResult<()>;
}
