//! `enrollment.completed` → `pharmacy.selected`
//!
//! Routing walks the pharmacy directory in order and picks the first active
//! pharmacy below the capacity threshold. The directory is the source of
//! truth for ceilings: a pharmacy with no cached capacity record is seeded
//! from its directory entry before it is checked.

use crate::context::{Progress, StageContext, record, record_progress, recorded};
use pharmonico_core::broker::BrokerMessage;
use pharmonico_core::cache::Cache;
use pharmonico_core::coordination::{
    CapacityRecord, CapacitySnapshot, CapacityTracker, CoordinationError, FailOpen,
};
use pharmonico_core::handler::{Handler, HandlerContext, HandlerError, HandlerFuture};
use pharmonico_core::payloads::{EnrollmentCompleted, PharmacySelected};
use pharmonico_core::prescription::{PrescriptionStatus, StoreError};
use pharmonico_core::topics;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

const STAGE: &str = "routing";

/// A dispensing pharmacy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pharmacy {
    /// Pharmacy id
    pub id: String,
    /// NCPDP provider id
    pub ncpdp_id: String,
    /// Prescriptions the pharmacy takes at once
    pub max_capacity: u32,
    /// Whether the pharmacy accepts new prescriptions
    pub active: bool,
}

impl Pharmacy {
    /// Active pharmacy.
    #[must_use]
    pub fn new(id: impl Into<String>, ncpdp_id: impl Into<String>, max_capacity: u32) -> Self {
        Self {
            id: id.into(),
            ncpdp_id: ncpdp_id.into(),
            max_capacity,
            active: true,
        }
    }

    /// Capacity snapshot with `current_count` routed prescriptions.
    #[must_use]
    pub fn snapshot(&self, current_count: u32) -> CapacitySnapshot {
        CapacitySnapshot {
            resource_id: self.id.clone(),
            current_count,
            max_count: self.max_capacity,
        }
    }
}

/// Boxed future returned by [`PharmacyDirectory`] methods.
pub type DirectoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Where routing finds pharmacies.
pub trait PharmacyDirectory: Send + Sync {
    /// Pharmacies in routing preference order, active or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be read.
    fn pharmacies(&self) -> DirectoryFuture<'_, Vec<Pharmacy>>;

    /// The pharmacy with `id`, active or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be read.
    fn pharmacy<'a>(&'a self, id: &'a str) -> DirectoryFuture<'a, Option<Pharmacy>> {
        Box::pin(async move {
            Ok(self
                .pharmacies()
                .await?
                .into_iter()
                .find(|pharmacy| pharmacy.id == id))
        })
    }
}

/// Fixed pharmacy list, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPharmacyDirectory {
    pharmacies: Vec<Pharmacy>,
}

impl StaticPharmacyDirectory {
    /// Directory over `pharmacies`, in preference order.
    #[must_use]
    pub const fn new(pharmacies: Vec<Pharmacy>) -> Self {
        Self { pharmacies }
    }

    /// Snapshots that reset every pharmacy to zero routed prescriptions.
    #[must_use]
    pub fn empty_snapshots(&self) -> Vec<CapacitySnapshot> {
        self.pharmacies.iter().map(|p| p.snapshot(0)).collect()
    }
}

impl PharmacyDirectory for StaticPharmacyDirectory {
    fn pharmacies(&self) -> DirectoryFuture<'_, Vec<Pharmacy>> {
        Box::pin(async move { Ok(self.pharmacies.clone()) })
    }
}

/// Chooses a pharmacy and reserves one unit of its capacity.
pub struct RoutingStage<C> {
    ctx: StageContext,
    capacity: CapacityTracker<C>,
    directory: Arc<dyn PharmacyDirectory>,
    threshold: f64,
}

impl<C: Cache> RoutingStage<C> {
    /// Create the stage.
    #[must_use]
    pub fn new(
        ctx: StageContext,
        capacity: CapacityTracker<C>,
        directory: Arc<dyn PharmacyDirectory>,
        threshold: f64,
    ) -> Self {
        Self {
            ctx,
            capacity,
            directory,
            threshold,
        }
    }

    /// First active pharmacy below the threshold.
    ///
    /// A capacity cache outage fails open: the pharmacy is treated as
    /// having room.
    async fn select(&self) -> Result<Option<Pharmacy>, HandlerError> {
        for pharmacy in self.directory.pharmacies().await? {
            if !pharmacy.active {
                continue;
            }
            let has_room = self
                .seeded(&pharmacy)
                .await
                .map(|record| record.has_capacity(self.threshold))
                .fail_open(true);
            if has_room {
                return Ok(Some(pharmacy));
            }
            tracing::debug!(pharmacy_id = %pharmacy.id, "Pharmacy at capacity");
        }
        Ok(None)
    }

    async fn seeded(&self, pharmacy: &Pharmacy) -> Result<CapacityRecord, CoordinationError> {
        if let Some(record) = self.capacity.get(&pharmacy.id).await? {
            return Ok(record);
        }
        tracing::debug!(
            pharmacy_id = %pharmacy.id,
            max = pharmacy.max_capacity,
            "Seeding capacity from directory"
        );
        self.capacity
            .set(&pharmacy.id, 0, pharmacy.max_capacity, None)
            .await
    }

    async fn run(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let (envelope, enrolled) = StageContext::decode::<EnrollmentCompleted>(&message.value)?;
        let mut prescription = self.ctx.load(&envelope).await?;

        let progress = Progress::of(prescription.status, PrescriptionStatus::PharmacySelected);
        record_progress(STAGE, progress);
        let payload = match progress {
            Progress::Skip => return Ok(()),
            Progress::Replay => recorded::<PharmacySelected>(&prescription, STAGE)?,
            Progress::Fresh => {
                let pharmacy = self.select().await?.ok_or_else(|| {
                    HandlerError::Rejected("no active pharmacy with capacity".to_string())
                })?;

                let now = self.ctx.now();
                let payload = PharmacySelected {
                    patient_id: enrolled.patient_id,
                    pharmacy_id: pharmacy.id.clone(),
                    pharmacy_ncpdp_id: pharmacy.ncpdp_id.clone(),
                    selected_at: now,
                };
                prescription.advance(PrescriptionStatus::PharmacySelected, now);
                prescription.pharmacy_id = Some(pharmacy.id.clone());
                record(&mut prescription, STAGE, &payload)?;
                self.ctx.save(&prescription).await?;

                if let Err(e) = self.capacity.increment(&pharmacy.id).await {
                    tracing::warn!(
                        pharmacy_id = %pharmacy.id,
                        error = %e,
                        "Failed to count routed prescription against capacity"
                    );
                }

                tracing::info!(
                    prescription_id = %prescription.id,
                    pharmacy_id = %pharmacy.id,
                    ncpdp_id = %pharmacy.ncpdp_id,
                    "Pharmacy selected"
                );
                payload
            },
        };

        self.ctx
            .emit(topics::PHARMACY_SELECTED, &envelope, &payload)
            .await
    }
}

impl<C: Cache + 'static> Handler for RoutingStage<C> {
    fn topic(&self) -> &str {
        topics::ENROLLMENT_COMPLETED
    }

    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(self.run(message))
    }
}
