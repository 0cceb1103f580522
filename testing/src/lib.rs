//! # Pharmonico Testing
//!
//! Test doubles for the workflow contracts.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: partitioned-log stand-in with failure injection
//! - [`InMemoryCache`]: TTL cache driven by tokio time
//! - [`InMemoryPrescriptionStore`]: document store
//! - Scripted handlers for consumer-loop tests
//! - [`FixedClock`] for deterministic timestamps
//!
//! ## Example
//!
//! ```
//! use pharmonico_core::coordination::{DedupKey, DeduplicationGuard, Reservation};
//! use pharmonico_testing::InMemoryCache;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = DeduplicationGuard::new(InMemoryCache::new());
//! let key = DedupKey::from_parts("p1", "00002-1234-01", "2025-01-01");
//!
//! assert_eq!(guard.check_and_reserve(&key).await?, Reservation::Fresh);
//! assert_eq!(guard.check_and_reserve(&key).await?, Reservation::Duplicate);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod cache;
pub mod handlers;
pub mod store;

use chrono::{DateTime, Utc};
use pharmonico_core::environment::Clock;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use pharmonico_testing::mocks::FixedClock;
    /// use pharmonico_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Fixed clock at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, InMemoryConsumer, InMemoryProducer};
pub use cache::InMemoryCache;
pub use handlers::{Delivery, FailingHandler, PanickingHandler, RecordingHandler};
pub use mocks::{FixedClock, test_clock};
pub use store::InMemoryPrescriptionStore;
