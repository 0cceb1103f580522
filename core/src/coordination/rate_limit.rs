//! Fixed-window rate limiter.
//!
//! Each identifier owns a counter at `rate_limit:count:{identifier}`. The
//! increment and the window TTL are one atomic cache call, so a counter
//! always expires and resets when its window ends.

use super::{CoordinationError, DEFAULT_OP_TIMEOUT, bounded};
use crate::cache::Cache;
use crate::environment::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Prefix of every rate-limit counter key.
pub const RATE_LIMIT_KEY_PREFIX: &str = "rate_limit:count:";

const PRIMITIVE: &str = "rate_limit";

/// Result of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the window, `-1` when unlimited
    pub remaining: i64,
    /// Estimated end of the window
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Decision for a request counted as the `count`-th of a window.
    #[must_use]
    pub const fn for_count(count: i64, limit: i64, reset_at: DateTime<Utc>) -> Self {
        let remaining = limit.saturating_sub(count);
        Self {
            allowed: count <= limit,
            remaining: if remaining < 0 { 0 } else { remaining },
            reset_at,
        }
    }

    /// Decision when no limit applies.
    #[must_use]
    pub const fn unlimited(reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining: -1,
            reset_at,
        }
    }
}

/// Counts requests per identifier in fixed windows.
#[derive(Clone)]
pub struct RateLimiter<C> {
    cache: C,
    op_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<C: Cache> RateLimiter<C> {
    /// Create a limiter using the system clock for `reset_at`.
    #[must_use]
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            op_timeout: DEFAULT_OP_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the per-call timeout.
    #[must_use]
    pub const fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Override the clock used to estimate `reset_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cache key for `identifier`.
    #[must_use]
    pub fn key(identifier: &str) -> String {
        format!("{RATE_LIMIT_KEY_PREFIX}{identifier}")
    }

    /// Count one request for `identifier` and decide whether it is within `limit`.
    ///
    /// A `limit` of zero or less disables limiting and touches no state.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the counter cannot be incremented.
    /// The counter is then unchanged.
    pub async fn check_limit(
        &self,
        identifier: &str,
        limit: i64,
        window: Duration,
    ) -> Result<RateLimitDecision, CoordinationError> {
        let reset_at = self.clock.now()
            + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());

        if limit <= 0 {
            return Ok(RateLimitDecision::unlimited(reset_at));
        }

        let key = Self::key(identifier);
        let count = bounded(
            PRIMITIVE,
            self.op_timeout,
            self.cache.increment_within(&key, window),
        )
        .await?;

        let decision = RateLimitDecision::for_count(count, limit, reset_at);
        if !decision.allowed {
            tracing::info!(identifier = %identifier, count, limit, "Rate limit exceeded");
        }
        Ok(decision)
    }

    /// Clear the counter for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the key cannot be deleted.
    pub async fn reset(&self, identifier: &str) -> Result<(), CoordinationError> {
        let key = Self::key(identifier);
        bounded(PRIMITIVE, self.op_timeout, self.cache.delete(&[key.as_str()])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    #[test]
    fn boundary_is_inclusive() {
        let at_limit = RateLimitDecision::for_count(3, 3, epoch());
        assert!(at_limit.allowed);
        assert_eq!(at_limit.remaining, 0);

        let over = RateLimitDecision::for_count(4, 3, epoch());
        assert!(!over.allowed);
        assert_eq!(over.remaining, 0);
    }

    #[test]
    fn unlimited_reports_negative_remaining() {
        let decision = RateLimitDecision::unlimited(epoch());
        assert!(decision.allowed);
        assert_eq!(decision.remaining, -1);
    }

    proptest! {
        #[test]
        fn remaining_never_negative(count in 1i64..10_000, limit in 1i64..10_000) {
            let decision = RateLimitDecision::for_count(count, limit, epoch());
            prop_assert!(decision.remaining >= 0);
            prop_assert_eq!(decision.allowed, count <= limit);
            prop_assert_eq!(decision.remaining, (limit - count).max(0));
        }
    }
}
