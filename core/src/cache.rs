//! Key-value cache contract used by the coordination primitives.
//!
//! The operations map onto Redis commands (`GET`, `SET EX`, `SET NX EX`,
//! `EXISTS`, `INCR`, `EXPIRE`, `DEL`). Implementations must make
//! [`Cache::set_if_absent`], [`Cache::increment`] and
//! [`Cache::increment_within`] atomic: the deduplication guard and the rate
//! limiter rely on nothing else.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by cache backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The backend cannot be reached
    #[error("Cache connection failed: {0}")]
    Connection(String),

    /// The backend rejected or failed a command
    #[error("Cache command failed: {0}")]
    Command(String),
}

/// Minimal TTL-aware key-value store.
pub trait Cache: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, CacheError>> + Send;

    /// Write a value that expires after `ttl`, replacing any previous value and TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Write a value only if the key does not exist. Returns `true` if written.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// Atomically add one to an integer counter (missing keys start at zero)
    /// and return the new value. The key's TTL is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails or the value is not an integer.
    fn increment(&self, key: &str) -> impl Future<Output = Result<i64, CacheError>> + Send;

    /// Atomically add one to an integer counter and, if the key has no TTL
    /// afterwards, attach `ttl`. Returns the new value.
    ///
    /// A counter can never be left without an expiry, even when it was
    /// created by [`Cache::increment`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails or the value is not an
    /// integer. On error neither the count nor the TTL changed.
    fn increment_within(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<i64, CacheError>> + Send;

    /// Set a TTL on an existing key. Returns `false` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails.
    fn expire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// Delete keys. Returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails.
    fn delete(&self, keys: &[&str]) -> impl Future<Output = Result<u64, CacheError>> + Send;
}
