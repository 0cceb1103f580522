//! In-memory TTL cache for tests.
//!
//! Expiry uses `tokio::time::Instant`, so tests running with paused time can
//! step past a TTL with `tokio::time::advance`. Every operation is atomic
//! under one mutex, matching the guarantees the coordination primitives need
//! from Redis.

use pharmonico_core::cache::{Cache, CacheError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Shared in-memory cache. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Current value, bypassing failure injection.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Remaining TTL of `key`; `None` if missing or without TTL.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|entry| entry.is_live(now)).count()
    }

    /// Whether no live key exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self) -> Result<(), CacheError> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Connection("cache unavailable".to_string()));
        }
        Ok(())
    }

    /// Run `f` on the map after dropping `key` if it expired.
    fn with_key<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let now = Instant::now();
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        f(&mut entries)
    }
}

impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.enter().await?;
        Ok(self.with_key(key, |entries| entries.get(key).map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.enter().await?;
        let expires_at = Some(Instant::now() + ttl);
        self.with_key(key, |entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at,
                },
            );
        });
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.enter().await?;
        let expires_at = Some(Instant::now() + ttl);
        Ok(self.with_key(key, |entries| {
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at,
                    },
                );
                true
            }
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.enter().await?;
        Ok(self.with_key(key, |entries| entries.contains_key(key)))
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        self.enter().await?;
        self.with_key(key, |entries| {
            let entry = entries.entry(key.to_string()).or_insert(Entry {
                value: "0".to_string(),
                expires_at: None,
            });
            let current: i64 = entry
                .value
                .parse()
                .map_err(|_| CacheError::Command("value is not an integer".to_string()))?;
            let next = current + 1;
            entry.value = next.to_string();
            Ok(next)
        })
    }

    async fn increment_within(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        self.enter().await?;
        let now = Instant::now();
        self.with_key(key, |entries| {
            let current: i64 = match entries.get(key) {
                Some(entry) => entry
                    .value
                    .parse()
                    .map_err(|_| CacheError::Command("value is not an integer".to_string()))?,
                None => 0,
            };
            let entry = entries.entry(key.to_string()).or_insert(Entry {
                value: "0".to_string(),
                expires_at: None,
            });
            entry.value = (current + 1).to_string();
            entry.expires_at.get_or_insert(now + ttl);
            Ok(current + 1)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.enter().await?;
        let expires_at = Some(Instant::now() + ttl);
        Ok(self.with_key(key, |entries| {
            entries.get_mut(key).is_some_and(|entry| {
                entry.expires_at = expires_at;
                true
            })
        }))
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, CacheError> {
        self.enter().await?;
        let mut removed = 0;
        for key in keys {
            if self.with_key(key, |entries| entries.remove(*key).is_some()) {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
