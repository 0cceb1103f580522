//! Intake: the entry point of every workflow run.
//!
//! [`IntakeService::submit`] takes an already-parsed prescription, guards it
//! with the rate limiter and the deduplication guard, stores it as
//! `received`, and publishes `intake.received`. Both guards fail open: a
//! cache outage lets the prescription through with a warning rather than
//! blocking intake.

use crate::metrics::IntakeMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use chrono::{DateTime, Utc};
use pharmonico_core::broker::{BrokerError, Producer};
use pharmonico_core::cache::Cache;
use pharmonico_core::coordination::{
    DedupKey, DeduplicationGuard, FailOpen, RateLimitDecision, RateLimiter, Reservation,
};
use pharmonico_core::envelope::{Envelope, EnvelopeError, new_correlation_id};
use pharmonico_core::environment::{Clock, SystemClock};
use pharmonico_core::payloads::IntakeReceived;
use pharmonico_core::prescription::{
    Medication, Patient, Prescriber, Prescription, PrescriptionStatus, PrescriptionStore,
    StoreError,
};
use pharmonico_core::topics;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const GENERATED_ID_DIGEST_LEN: usize = 16;

/// An already-parsed prescription submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeRequest {
    /// Rate-limit identity of the submitter (API key, IP, ...)
    pub client_id: String,
    /// Correlation id of the inbound request, if any
    pub correlation_id: Option<String>,
    /// Caller-assigned prescription id, if any
    pub prescription_id: Option<String>,
    /// Patient
    pub patient: Patient,
    /// Prescriber
    pub prescriber: Prescriber,
    /// Medication
    pub medication: Medication,
    /// Date written (`YYYY-MM-DD`), may be empty
    pub date_written: String,
}

impl IntakeRequest {
    /// Deduplication key: patient, drug, and date written.
    ///
    /// An empty patient id falls back to `{first}_{last}`; an empty date
    /// falls back to the UTC date of `now`.
    #[must_use]
    pub fn dedup_key(&self, now: DateTime<Utc>) -> DedupKey {
        let natural_key = if self.patient.id.is_empty() {
            format!("{}_{}", self.patient.first_name, self.patient.last_name)
        } else {
            self.patient.id.clone()
        };
        let date_written = if self.date_written.is_empty() {
            now.format("%Y-%m-%d").to_string()
        } else {
            self.date_written.clone()
        };
        DedupKey::from_parts(&natural_key, &self.medication.ndc, &date_written)
    }

    /// Prescription id: caller-assigned, or `rx_{digest}_{patient}_{ndc}`
    /// where `digest` is the first 16 hex characters of the dedup key.
    ///
    /// The generated id is stable across resubmissions of the same
    /// prescription, so a retry after a failed publish overwrites the
    /// document it left behind instead of adding a second one.
    #[must_use]
    pub fn prescription_id(&self, key: &DedupKey) -> String {
        match &self.prescription_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let digest = key.digest();
                format!(
                    "rx_{}_{}_{}",
                    &digest[..digest.len().min(GENERATED_ID_DIGEST_LEN)],
                    self.patient.id,
                    self.medication.ndc
                )
            },
        }
    }
}

/// Result of a submission that reached a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// Stored and published
    Accepted {
        /// The published `intake.received` envelope
        envelope: Envelope,
    },
    /// Same prescription submitted within the dedup window
    Duplicate {
        /// The reserved key
        key: DedupKey,
    },
    /// Client exceeded its rate limit
    RateLimited {
        /// Limiter decision, for `Retry-After` style responses
        decision: RateLimitDecision,
    },
}

/// Errors from intake.
#[derive(Error, Debug)]
pub enum IntakeError {
    /// The prescription could not be stored
    #[error("Failed to store prescription: {0}")]
    Store(#[from] StoreError),

    /// The envelope could not be built
    #[error("Failed to build intake envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Publishing `intake.received` failed after retries
    #[error("Failed to publish intake event: {0}")]
    Publish(#[from] BrokerError),
}

/// Intake limits and timings.
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeConfig {
    /// Requests per window and client; `0` or less disables limiting
    pub rate_limit: i64,
    /// Rate-limit window
    pub rate_window: Duration,
    /// Lifetime of a dedup reservation
    pub dedup_ttl: Duration,
    /// Retries for publishing `intake.received`
    pub publish_retry: RetryPolicy,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            rate_limit: 0,
            rate_window: Duration::from_secs(60),
            dedup_ttl: Duration::from_secs(5 * 60),
            publish_retry: RetryPolicy::default(),
        }
    }
}

/// Admits prescriptions into the workflow.
pub struct IntakeService<C> {
    limiter: RateLimiter<C>,
    dedup: DeduplicationGuard<C>,
    store: Arc<dyn PrescriptionStore>,
    producer: Arc<dyn Producer>,
    config: IntakeConfig,
    clock: Arc<dyn Clock>,
}

impl<C: Cache + Clone> IntakeService<C> {
    /// Create a service with default configuration.
    #[must_use]
    pub fn new(cache: C, store: Arc<dyn PrescriptionStore>, producer: Arc<dyn Producer>) -> Self {
        let config = IntakeConfig::default();
        Self {
            limiter: RateLimiter::new(cache.clone()),
            dedup: DeduplicationGuard::new(cache).with_ttl(config.dedup_ttl),
            store,
            producer,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: IntakeConfig) -> Self {
        self.dedup = self.dedup.with_ttl(config.dedup_ttl);
        self.config = config;
        self
    }

    /// Bound every cache call by `timeout`.
    #[must_use]
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.limiter = self.limiter.with_op_timeout(timeout);
        self.dedup = self.dedup.with_op_timeout(timeout);
        self
    }

    /// Override the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.limiter = self.limiter.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Admit one prescription.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError`] if storing or publishing fails. The dedup
    /// reservation is released first so the client can resubmit.
    pub async fn submit(&self, request: IntakeRequest) -> Result<IntakeOutcome, IntakeError> {
        let now = self.clock.now();

        let decision = self
            .limiter
            .check_limit(&request.client_id, self.config.rate_limit, self.config.rate_window)
            .await
            .inspect_err(|_| IntakeMetrics::record_fail_open("rate_limit"))
            .fail_open(RateLimitDecision::unlimited(now));
        if !decision.allowed {
            IntakeMetrics::record_outcome("rate_limited");
            tracing::info!(client_id = %request.client_id, "Intake rate limited");
            return Ok(IntakeOutcome::RateLimited { decision });
        }

        let key = request.dedup_key(now);
        let reservation = self
            .dedup
            .check_and_reserve(&key)
            .await
            .inspect_err(|_| IntakeMetrics::record_fail_open("dedup"))
            .fail_open(Reservation::Fresh);
        if reservation == Reservation::Duplicate {
            IntakeMetrics::record_outcome("duplicate");
            tracing::info!(dedup_key = %key, "Duplicate prescription rejected");
            return Ok(IntakeOutcome::Duplicate { key });
        }

        match self.admit(request, &key, now).await {
            Ok(None) => {
                IntakeMetrics::record_outcome("duplicate");
                tracing::info!(dedup_key = %key, "Prescription already in progress, not re-admitted");
                Ok(IntakeOutcome::Duplicate { key })
            },
            Ok(Some(envelope)) => {
                IntakeMetrics::record_outcome("accepted");
                tracing::info!(
                    prescription_id = %envelope.subject_id(),
                    correlation_id = %envelope.correlation_id(),
                    "Prescription accepted"
                );
                Ok(IntakeOutcome::Accepted { envelope })
            },
            Err(e) => {
                IntakeMetrics::record_outcome("failed");
                if let Err(release_error) = self.dedup.release(&key).await {
                    tracing::warn!(
                        dedup_key = %key,
                        error = %release_error,
                        "Failed to release dedup reservation"
                    );
                }
                Err(e)
            },
        }
    }

    /// Store and publish; `None` when the document already moved past
    /// `received` and must not be reset.
    async fn admit(
        &self,
        request: IntakeRequest,
        key: &DedupKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Envelope>, IntakeError> {
        let prescription_id = request.prescription_id(key);
        let existing = self.store.get(&prescription_id).await?;
        let progressed = existing.filter(|p| p.status.rank() > PrescriptionStatus::Received.rank());
        if let Some(existing) = progressed {
            tracing::debug!(
                prescription_id = %prescription_id,
                status = ?existing.status,
                "Stored prescription already progressed"
            );
            return Ok(None);
        }

        let prescription = Prescription::received(
            prescription_id.clone(),
            request.patient,
            request.prescriber,
            request.medication,
            request.date_written,
            now,
        );
        self.store.save(&prescription).await?;

        let payload = IntakeReceived {
            status: PrescriptionStatus::Received,
            patient: prescription.patient,
            prescriber: prescription.prescriber,
            medication: prescription.medication,
            date_written: prescription.date_written,
            created_at: now,
        };
        let correlation_id = request
            .correlation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_correlation_id);
        let envelope = Envelope::from_typed(correlation_id, prescription_id, &payload, now)?;
        let bytes = envelope.to_bytes()?;

        retry_with_predicate(
            &self.config.publish_retry,
            || {
                self.producer.publish(
                    topics::INTAKE_RECEIVED,
                    envelope.subject_id().as_bytes(),
                    &bytes,
                )
            },
            BrokerError::is_transient,
        )
        .await?;

        Ok(Some(envelope))
    }
}
