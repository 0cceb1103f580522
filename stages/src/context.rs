//! Shared plumbing for stage handlers: loading, saving, emitting, and the
//! replay rule.

use chrono::{DateTime, Utc};
use metrics::counter;
use pharmonico_core::broker::Producer;
use pharmonico_core::envelope::Envelope;
use pharmonico_core::environment::{Clock, SystemClock};
use pharmonico_core::handler::HandlerError;
use pharmonico_core::prescription::{
    Prescription, PrescriptionStatus, PrescriptionStore, StoreError,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

/// How a stage relates to the prescription it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The stage has not run yet
    Fresh,
    /// The stage already ran; re-emit its recorded result without side effects
    Replay,
    /// The prescription is elsewhere in the workflow; do nothing
    Skip,
}

impl Progress {
    /// Classify a prescription in `current` against a stage that moves it to `target`.
    #[must_use]
    pub fn of(current: PrescriptionStatus, target: PrescriptionStatus) -> Self {
        if current == target {
            Self::Replay
        } else if current.is_terminal() || current.rank() >= target.rank() {
            Self::Skip
        } else {
            Self::Fresh
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Replay => "replay",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dependencies every stage shares.
#[derive(Clone)]
pub struct StageContext {
    store: Arc<dyn PrescriptionStore>,
    producer: Arc<dyn Producer>,
    clock: Arc<dyn Clock>,
}

impl StageContext {
    /// Context over a store and producer, using the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn PrescriptionStore>, producer: Arc<dyn Producer>) -> Self {
        Self {
            store,
            producer,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Decode the envelope and its typed payload.
    pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<(Envelope, T), HandlerError> {
        let envelope = Envelope::decode(raw)?;
        let payload = envelope.payload_as::<T>()?;
        Ok((envelope, payload))
    }

    /// Load the envelope's prescription; a missing document is an error.
    pub(crate) async fn load(&self, envelope: &Envelope) -> Result<Prescription, HandlerError> {
        self.store
            .get(envelope.subject_id())
            .await?
            .ok_or_else(|| HandlerError::NotFound {
                entity: "prescription",
                id: envelope.subject_id().to_string(),
            })
    }

    pub(crate) async fn save(&self, prescription: &Prescription) -> Result<(), HandlerError> {
        self.store.save(prescription).await?;
        Ok(())
    }

    /// Publish the successor of `envelope` on `topic`, keyed by prescription id.
    pub(crate) async fn emit<T: Serialize>(
        &self,
        topic: &str,
        envelope: &Envelope,
        payload: &T,
    ) -> Result<(), HandlerError> {
        let next = envelope.typed_successor(payload, self.now())?;
        let bytes = next.to_bytes()?;
        self.producer
            .publish(topic, next.subject_id().as_bytes(), &bytes)
            .await?;
        tracing::debug!(
            topic = %topic,
            prescription_id = %next.subject_id(),
            correlation_id = %next.correlation_id(),
            "Stage emitted successor"
        );
        Ok(())
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext").finish_non_exhaustive()
    }
}

/// Store a stage's emitted payload under `details[stage]` so a replay can
/// re-emit it unchanged.
pub(crate) fn record<T: Serialize>(
    prescription: &mut Prescription,
    stage: &str,
    payload: &T,
) -> Result<(), HandlerError> {
    let value = serde_json::to_value(payload)
        .map_err(|e| StoreError::Serialization(format!("{stage} details: {e}")))?;
    prescription.set_detail(stage, value);
    Ok(())
}

/// Read back what [`record`] stored.
pub(crate) fn recorded<T: DeserializeOwned>(
    prescription: &Prescription,
    stage: &str,
) -> Result<T, HandlerError> {
    let value = prescription.details.get(stage).cloned().ok_or_else(|| {
        HandlerError::Rejected(format!(
            "{} is {} but has no {stage} details",
            prescription.id, prescription.status
        ))
    })?;
    serde_json::from_value(value).map_err(|e| {
        HandlerError::Store(StoreError::Serialization(format!(
            "{stage} details of {}: {e}",
            prescription.id
        )))
    })
}

/// Count one stage run by outcome.
pub(crate) fn record_progress(stage: &'static str, progress: Progress) {
    counter!(
        "pharmonico_stage_runs_total",
        "stage" => stage,
        "progress" => progress.as_str()
    )
    .increment(1);
}
