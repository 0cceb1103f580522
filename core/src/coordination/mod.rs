//! Cache-backed coordination primitives.
//!
//! - [`DeduplicationGuard`]: rejects a second submission of the same prescription
//! - [`RateLimiter`]: fixed-window request counting per client
//! - [`CapacityTracker`]: per-pharmacy load records used by routing
//!
//! Every primitive bounds each cache call with its own timeout and reports
//! infrastructure trouble as [`CoordinationError`], never as a decision. Call
//! sites that prefer availability over strictness opt in through [`FailOpen`].

pub mod capacity;
pub mod dedup;
pub mod rate_limit;

pub use capacity::{CapacityRecord, CapacitySnapshot, CapacityTracker};
pub use dedup::{DedupKey, DeduplicationGuard, Reservation};
pub use rate_limit::{RateLimitDecision, RateLimiter};

use crate::cache::CacheError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default bound on a single cache call.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from coordination primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// The cache failed the call
    #[error("{primitive} unavailable: {reason}")]
    Unavailable {
        /// Primitive that issued the call
        primitive: &'static str,
        /// Backend error text
        reason: String,
    },

    /// The cache did not answer within the primitive's timeout
    #[error("{primitive} timed out after {after:?}")]
    Timeout {
        /// Primitive that issued the call
        primitive: &'static str,
        /// The elapsed bound
        after: Duration,
    },

    /// A stored record could not be decoded
    #[error("Corrupt {primitive} record at '{key}': {reason}")]
    CorruptRecord {
        /// Primitive that owns the record
        primitive: &'static str,
        /// Cache key
        key: String,
        /// Decode error text
        reason: String,
    },
}

/// Run one cache call under a timeout, mapping failures to [`CoordinationError`].
pub(crate) async fn bounded<T, F>(
    primitive: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, CoordinationError>
where
    F: Future<Output = Result<T, CacheError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CoordinationError::Unavailable {
            primitive,
            reason: e.to_string(),
        }),
        Err(_) => Err(CoordinationError::Timeout {
            primitive,
            after: timeout,
        }),
    }
}

/// Explicit fail-open policy for coordination results.
///
/// ```
/// use pharmonico_core::coordination::{CoordinationError, FailOpen, Reservation};
///
/// let outage: Result<Reservation, CoordinationError> = Err(CoordinationError::Unavailable {
///     primitive: "dedup",
///     reason: "connection refused".to_string(),
/// });
/// assert_eq!(outage.fail_open(Reservation::Fresh), Reservation::Fresh);
/// ```
pub trait FailOpen<T> {
    /// Return the decision, or `fallback` (with a warning) if the primitive was unavailable.
    fn fail_open(self, fallback: T) -> T;
}

impl<T> FailOpen<T> for Result<T, CoordinationError> {
    fn fail_open(self, fallback: T) -> T {
        self.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Coordination unavailable, failing open");
            fallback
        })
    }
}
