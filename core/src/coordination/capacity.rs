//! Per-pharmacy daily capacity records.
//!
//! Records live at `pharmacy_capacity:{resource_id}` as JSON and expire a few
//! minutes after their last mutation, so the cache only ever holds a recent
//! view of load. Updates are read-modify-write: two routers incrementing the
//! same pharmacy at the same instant can lose one increment. Routing treats
//! the numbers as advisory and [`CapacityTracker::reconcile`] restores them
//! from the source of truth.

use super::{CoordinationError, DEFAULT_OP_TIMEOUT, bounded};
use crate::cache::Cache;
use crate::environment::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Prefix of every capacity record key.
pub const CAPACITY_KEY_PREFIX: &str = "pharmacy_capacity:";

/// Ceiling given to records created on first use.
pub const DEFAULT_MAX_CAPACITY: u32 = 100;

/// TTL refreshed on every mutation.
pub const DEFAULT_CAPACITY_TTL: Duration = Duration::from_secs(5 * 60);

/// Utilization at or above which a pharmacy is considered full.
pub const DEFAULT_CAPACITY_THRESHOLD: f64 = 0.95;

const PRIMITIVE: &str = "capacity";

/// Cached load of one pharmacy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityRecord {
    /// Pharmacy id
    #[serde(rename = "pharmacy_id")]
    pub resource_id: String,
    /// Prescriptions routed today
    #[serde(rename = "current_daily_rx")]
    pub current_count: u32,
    /// Daily ceiling
    #[serde(rename = "max_daily_rx")]
    pub max_count: u32,
    /// `current_count / max_count`, stored for readers that only look at the cache
    pub utilization: f64,
    /// Time of the last mutation
    pub last_updated: DateTime<Utc>,
}

impl CapacityRecord {
    /// Build a record and compute its utilization.
    #[must_use]
    pub fn new(
        resource_id: impl Into<String>,
        current_count: u32,
        max_count: u32,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            current_count,
            max_count,
            utilization: utilization(current_count, max_count),
            last_updated,
        }
    }

    /// Whether utilization is strictly below `threshold`.
    #[must_use]
    pub fn has_capacity(&self, threshold: f64) -> bool {
        self.utilization < threshold
    }

    fn with_count(mut self, current_count: u32, at: DateTime<Utc>) -> Self {
        self.current_count = current_count;
        self.utilization = utilization(current_count, self.max_count);
        self.last_updated = at;
        self
    }
}

/// `current / max`, or `0` when `max` is zero.
#[must_use]
pub fn utilization(current: u32, max: u32) -> f64 {
    if max == 0 {
        0.0
    } else {
        f64::from(current) / f64::from(max)
    }
}

/// Authoritative load figures used to overwrite cached records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacitySnapshot {
    /// Pharmacy id
    pub resource_id: String,
    /// Prescriptions routed today
    pub current_count: u32,
    /// Daily ceiling
    pub max_count: u32,
}

/// Reads and updates capacity records.
#[derive(Clone)]
pub struct CapacityTracker<C> {
    cache: C,
    ttl: Duration,
    default_max: u32,
    op_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<C: Cache> CapacityTracker<C> {
    /// Create a tracker with default TTL, ceiling, and call timeout.
    #[must_use]
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            ttl: DEFAULT_CAPACITY_TTL,
            default_max: DEFAULT_MAX_CAPACITY,
            op_timeout: DEFAULT_OP_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the record TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the ceiling of lazily created records.
    #[must_use]
    pub const fn with_default_max(mut self, max: u32) -> Self {
        self.default_max = max;
        self
    }

    /// Override the per-call timeout.
    #[must_use]
    pub const fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Override the clock used for `last_updated`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cache key for `resource_id`.
    #[must_use]
    pub fn key(resource_id: &str) -> String {
        format!("{CAPACITY_KEY_PREFIX}{resource_id}")
    }

    /// Read the record, if one is cached.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the cache fails or the record is corrupt.
    pub async fn get(&self, resource_id: &str) -> Result<Option<CapacityRecord>, CoordinationError> {
        let key = Self::key(resource_id);
        let raw = bounded(PRIMITIVE, self.op_timeout, self.cache.get(&key)).await?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| CoordinationError::CorruptRecord {
                primitive: PRIMITIVE,
                key,
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    /// Overwrite the record. `ttl` defaults to the tracker's TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the cache fails.
    pub async fn set(
        &self,
        resource_id: &str,
        current_count: u32,
        max_count: u32,
        ttl: Option<Duration>,
    ) -> Result<CapacityRecord, CoordinationError> {
        let record = CapacityRecord::new(resource_id, current_count, max_count, self.clock.now());
        self.store(&record, ttl.unwrap_or(self.ttl)).await?;
        Ok(record)
    }

    /// Add one routed prescription, creating the record with the default
    /// ceiling if none is cached.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the cache fails or the record is corrupt.
    pub async fn increment(&self, resource_id: &str) -> Result<CapacityRecord, CoordinationError> {
        let now = self.clock.now();
        let current = self.load_or_default(resource_id, now).await?;
        let next = current.current_count.saturating_add(1);
        let record = current.with_count(next, now);
        self.store(&record, self.ttl).await?;

        tracing::debug!(
            resource_id = %resource_id,
            current = record.current_count,
            max = record.max_count,
            utilization = record.utilization,
            "Capacity incremented"
        );
        Ok(record)
    }

    /// Remove one routed prescription; never goes below zero.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the cache fails or the record is corrupt.
    pub async fn decrement(&self, resource_id: &str) -> Result<CapacityRecord, CoordinationError> {
        let now = self.clock.now();
        let current = self.load_or_default(resource_id, now).await?;
        let next = current.current_count.saturating_sub(1);
        let record = current.with_count(next, now);
        self.store(&record, self.ttl).await?;

        tracing::debug!(
            resource_id = %resource_id,
            current = record.current_count,
            utilization = record.utilization,
            "Capacity decremented"
        );
        Ok(record)
    }

    /// Whether the pharmacy is below `threshold` (default 0.95).
    ///
    /// A pharmacy without a cached record has no recorded load and is
    /// reported as having capacity.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the cache fails or the record is corrupt.
    pub async fn has_capacity(
        &self,
        resource_id: &str,
        threshold: Option<f64>,
    ) -> Result<bool, CoordinationError> {
        let threshold = threshold.unwrap_or(DEFAULT_CAPACITY_THRESHOLD);
        Ok(self
            .get(resource_id)
            .await?
            .is_none_or(|record| record.has_capacity(threshold)))
    }

    /// Drop the cached record.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError`] if the cache fails.
    pub async fn delete(&self, resource_id: &str) -> Result<bool, CoordinationError> {
        let key = Self::key(resource_id);
        let removed = bounded(PRIMITIVE, self.op_timeout, self.cache.delete(&[key.as_str()])).await?;
        Ok(removed > 0)
    }

    /// Overwrite cached records from authoritative snapshots.
    ///
    /// Returns how many records were written.
    ///
    /// # Errors
    ///
    /// Stops at the first cache failure and returns it.
    pub async fn reconcile<I>(&self, snapshots: I) -> Result<usize, CoordinationError>
    where
        I: IntoIterator<Item = CapacitySnapshot>,
    {
        let mut written = 0;
        for snapshot in snapshots {
            self.set(
                &snapshot.resource_id,
                snapshot.current_count,
                snapshot.max_count,
                None,
            )
            .await?;
            written += 1;
        }
        tracing::info!(records = written, "Capacity cache reconciled");
        Ok(written)
    }

    async fn load_or_default(
        &self,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CapacityRecord, CoordinationError> {
        Ok(self
            .get(resource_id)
            .await?
            .unwrap_or_else(|| CapacityRecord::new(resource_id, 0, self.default_max, now)))
    }

    async fn store(&self, record: &CapacityRecord, ttl: Duration) -> Result<(), CoordinationError> {
        let key = Self::key(&record.resource_id);
        let json = serde_json::to_string(record).map_err(|e| CoordinationError::CorruptRecord {
            primitive: PRIMITIVE,
            key: key.clone(),
            reason: e.to_string(),
        })?;
        bounded(PRIMITIVE, self.op_timeout, self.cache.set(&key, &json, ttl)).await
    }
}
