//! Redis backend for the Pharmonico coordination primitives.
//!
//! [`RedisCache`] implements [`Cache`] over a `redis::aio::ConnectionManager`,
//! so one connection is multiplexed across every guard, limiter, and tracker
//! in the worker and is re-established automatically after a drop.
//!
//! Each [`Cache`] operation is a single Redis command or script:
//!
//! | Operation          | Command                            |
//! |--------------------|------------------------------------|
//! | `get`              | `GET`                              |
//! | `set`              | `SET key value PX`                 |
//! | `set_if_absent`    | `SET key value NX PX`              |
//! | `exists`           | `EXISTS`                           |
//! | `increment`        | `INCR`                             |
//! | `increment_within` | Lua: `INCR`, then `PEXPIRE` if no TTL |
//! | `expire`           | `PEXPIRE`                          |
//! | `delete`           | `DEL`                              |
//!
//! TTLs are sent in milliseconds and rounded up to at least one.
//!
//! # Example
//!
//! ```no_run
//! use pharmonico_core::coordination::{DedupKey, DeduplicationGuard};
//! use pharmonico_redis::RedisCache;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisCache::connect("redis://127.0.0.1:6379").await?;
//! let guard = DeduplicationGuard::new(cache);
//!
//! let key = DedupKey::from_parts("p1", "00002-1234-01", "2025-01-01");
//! let reservation = guard.check_and_reserve(&key).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use pharmonico_core::cache::{Cache, CacheError};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

/// Redis-backed [`Cache`]. Clones share the connection.
#[derive(Clone)]
pub struct RedisCache {
    /// Connection manager for multiplexed, self-healing connections.
    conn_manager: ConnectionManager,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("conn_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisCache {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - `Redis` connection URL (e.g., "<redis://127.0.0.1:6379>")
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Connection`] if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url).map_err(|e| {
            CacheError::Connection(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CacheError::Connection(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!(url = %redact_url(redis_url), "Connected to Redis");
        Ok(Self { conn_manager })
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub const fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }

    /// Round-trip a `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the server does not answer.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("PING", &e))?;
        Ok(())
    }
}

impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("GET", &e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| command_error("SET", &e))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        // Nil reply means the key already existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SET NX", &e))?;

        let written = reply.is_some();
        tracing::trace!(key = %key, written, "SET NX");
        Ok(written)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("EXISTS", &e))
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.conn_manager.clone();
        redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("INCR", &e))
    }

    async fn increment_within(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.conn_manager.clone();
        let mut invocation = INCREMENT_WITHIN.key(key);
        invocation.arg(ttl_millis(ttl));
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("INCR+PEXPIRE", &e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("PEXPIRE", &e))
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn_manager.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("DEL", &e))
    }
}

/// Runs as one script so the counter and its TTL change together.
static INCREMENT_WITHIN: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local count = redis.call('INCR', KEYS[1])
        if redis.call('PTTL', KEYS[1]) < 0 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
        end
        return count
        ",
    )
});

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn command_error(command: &str, error: &RedisError) -> CacheError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
        CacheError::Connection(format!("Redis {command} failed: {error}"))
    } else {
        CacheError::Command(format!("Redis {command} failed: {error}"))
    }
}

/// Strip the password from a connection URL before logging it.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        },
        _ => url.to_string(),
    }
}
