//! Duplicate-submission guard.
//!
//! A prescription is identified by `(patient, drug, date written)`. The guard
//! reserves a hash of that triple with a single atomic set-if-absent, so among
//! any number of concurrent submissions exactly one observes
//! [`Reservation::Fresh`] until the reservation expires.

use super::{CoordinationError, DEFAULT_OP_TIMEOUT, bounded};
use crate::cache::Cache;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// Prefix of every deduplication key.
pub const DEDUP_KEY_PREFIX: &str = "rx:dedup:";

/// How long a reservation blocks resubmission.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(5 * 60);

const PRIMITIVE: &str = "dedup";

/// Cache key for one prescription's natural identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    /// Derive the key from its parts: `rx:dedup:` + hex SHA-256 of
    /// `"{natural_key}:{drug_identifier}:{date_written}"`.
    #[must_use]
    pub fn from_parts(natural_key: &str, drug_identifier: &str, date_written: &str) -> Self {
        let digest = Sha256::digest(format!("{natural_key}:{drug_identifier}:{date_written}"));
        Self(format!("{DEDUP_KEY_PREFIX}{digest:x}"))
    }

    /// The full cache key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex digest without the prefix.
    #[must_use]
    pub fn digest(&self) -> &str {
        self.0.strip_prefix(DEDUP_KEY_PREFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// This caller owns the key for the TTL
    Fresh,
    /// Someone reserved the key within the TTL
    Duplicate,
}

impl Reservation {
    /// `true` for [`Reservation::Fresh`].
    #[must_use]
    pub const fn is_fresh(self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Reserves deduplication keys in the cache.
#[derive(Debug, Clone)]
pub struct DeduplicationGuard<C> {
    cache: C,
    ttl: Duration,
    op_timeout: Duration,
}

impl<C: Cache> DeduplicationGuard<C> {
    /// Create a guard with the default TTL and call timeout.
    #[must_use]
    pub const fn new(cache: C) -> Self {
        Self {
            cache,
            ttl: DEFAULT_DEDUP_TTL,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Override the reservation TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the per-call timeout.
    #[must_use]
    pub const fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Reserve `key` for the default TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the cache is unavailable or slow.
    pub async fn check_and_reserve(&self, key: &DedupKey) -> Result<Reservation, CoordinationError> {
        self.check_and_reserve_with_ttl(key, self.ttl).await
    }

    /// Reserve `key` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the cache is unavailable or slow.
    pub async fn check_and_reserve_with_ttl(
        &self,
        key: &DedupKey,
        ttl: Duration,
    ) -> Result<Reservation, CoordinationError> {
        let written = bounded(
            PRIMITIVE,
            self.op_timeout,
            self.cache.set_if_absent(key.as_str(), "1", ttl),
        )
        .await?;

        let reservation = if written {
            Reservation::Fresh
        } else {
            Reservation::Duplicate
        };
        tracing::debug!(key = %key, ?reservation, "Dedup reservation checked");
        Ok(reservation)
    }

    /// Drop a reservation so the same prescription can be submitted again.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the cache is unavailable or slow.
    pub async fn release(&self, key: &DedupKey) -> Result<bool, CoordinationError> {
        let removed = bounded(PRIMITIVE, self.op_timeout, self.cache.delete(&[key.as_str()])).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_is_prefixed_lowercase_hex() {
        let key = DedupKey::from_parts("p1", "00002-1234-01", "2025-01-01");
        assert!(key.as_str().starts_with(DEDUP_KEY_PREFIX));
        assert_eq!(key.as_str().len(), DEDUP_KEY_PREFIX.len() + 64);
        assert!(
            key.as_str()[DEDUP_KEY_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
    }

    #[test]
    fn digest_drops_the_prefix() {
        let key = DedupKey::from_parts("p1", "00002-1234-01", "2025-01-01");
        assert_eq!(key.digest().len(), 64);
        assert_eq!(format!("{DEDUP_KEY_PREFIX}{}", key.digest()), key.as_str());
    }

    #[test]
    fn parts_are_separated() {
        assert_ne!(
            DedupKey::from_parts("p1", "23", "2025-01-01"),
            DedupKey::from_parts("p12", "3", "2025-01-01")
        );
    }

    proptest! {
        #[test]
        fn key_is_deterministic(patient in "[a-z0-9_]{1,16}", ndc in "[0-9-]{1,13}", date in "[0-9-]{0,10}") {
            let a = DedupKey::from_parts(&patient, &ndc, &date);
            let b = DedupKey::from_parts(&patient, &ndc, &date);
            prop_assert_eq!(a, b);
        }
    }
}
