//! Carrier tracking.
//!
//! [`DeliveryStage`] marks a labeled shipment `in_transit` and emits nothing:
//! delivery is confirmed later by the carrier publishing
//! `shipment.delivered`, which [`DeliveryConfirmationStage`] turns into the
//! terminal `delivered` status while returning the pharmacy's capacity.
//! A capacity record that expired in the meantime is re-seeded with the
//! directory's ceiling rather than the tracker default.

use crate::context::{Progress, StageContext, record, record_progress};
use crate::routing::PharmacyDirectory;
use pharmonico_core::broker::BrokerMessage;
use pharmonico_core::cache::Cache;
use pharmonico_core::coordination::{CapacityRecord, CapacityTracker, CoordinationError};
use pharmonico_core::handler::{Handler, HandlerContext, HandlerError, HandlerFuture};
use pharmonico_core::payloads::{ShipmentDelivered, ShipmentLabelCreated};
use pharmonico_core::prescription::PrescriptionStatus;
use pharmonico_core::topics;
use std::sync::Arc;

/// Starts tracking a shipment.
#[derive(Debug, Clone)]
pub struct DeliveryStage {
    ctx: StageContext,
}

impl DeliveryStage {
    /// Create the stage.
    #[must_use]
    pub const fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    async fn run(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let (envelope, label) = StageContext::decode::<ShipmentLabelCreated>(&message.value)?;
        let mut prescription = self.ctx.load(&envelope).await?;

        let progress = Progress::of(prescription.status, PrescriptionStatus::InTransit);
        record_progress("delivery", progress);
        if progress != Progress::Fresh {
            return Ok(());
        }

        prescription.advance(PrescriptionStatus::InTransit, self.ctx.now());
        self.ctx.save(&prescription).await?;
        tracing::info!(
            prescription_id = %prescription.id,
            tracking_number = %label.tracking_number,
            carrier = %label.carrier,
            "Shipment in transit"
        );
        Ok(())
    }
}

impl Handler for DeliveryStage {
    fn topic(&self) -> &str {
        topics::SHIPMENT_LABEL_CREATED
    }

    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(self.run(message))
    }
}

/// Closes the workflow when the carrier confirms delivery.
pub struct DeliveryConfirmationStage<C> {
    ctx: StageContext,
    capacity: CapacityTracker<C>,
    directory: Arc<dyn PharmacyDirectory>,
}

impl<C: Cache> DeliveryConfirmationStage<C> {
    /// Create the stage.
    #[must_use]
    pub fn new(
        ctx: StageContext,
        capacity: CapacityTracker<C>,
        directory: Arc<dyn PharmacyDirectory>,
    ) -> Self {
        Self {
            ctx,
            capacity,
            directory,
        }
    }

    /// Return one unit of capacity.
    ///
    /// With no cached record there is nothing to subtract from; the record
    /// is recreated empty with the pharmacy's ceiling. A pharmacy the
    /// directory does not know falls back to the tracker default.
    async fn release(&self, pharmacy_id: &str) -> Result<CapacityRecord, CoordinationError> {
        if self.capacity.get(pharmacy_id).await?.is_none() {
            match self.directory.pharmacy(pharmacy_id).await {
                Ok(Some(pharmacy)) => {
                    tracing::debug!(
                        pharmacy_id = %pharmacy_id,
                        max = pharmacy.max_capacity,
                        "Seeding capacity from directory"
                    );
                    return self
                        .capacity
                        .set(pharmacy_id, 0, pharmacy.max_capacity, None)
                        .await;
                },
                Ok(None) => {},
                Err(e) => tracing::warn!(
                    pharmacy_id = %pharmacy_id,
                    error = %e,
                    "Failed to read pharmacy directory"
                ),
            }
        }
        self.capacity.decrement(pharmacy_id).await
    }

    async fn run(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let (envelope, delivered) = StageContext::decode::<ShipmentDelivered>(&message.value)?;
        let mut prescription = self.ctx.load(&envelope).await?;

        let progress = Progress::of(prescription.status, PrescriptionStatus::Delivered);
        record_progress("delivery_confirmation", progress);
        if progress != Progress::Fresh {
            return Ok(());
        }

        prescription.advance(PrescriptionStatus::Delivered, self.ctx.now());
        record(&mut prescription, "delivery", &delivered)?;
        self.ctx.save(&prescription).await?;

        // Released once: a replay finds the prescription already delivered.
        if let Some(pharmacy_id) = &prescription.pharmacy_id {
            if let Err(e) = self.release(pharmacy_id).await {
                tracing::warn!(
                    pharmacy_id = %pharmacy_id,
                    error = %e,
                    "Failed to release pharmacy capacity"
                );
            }
        }

        tracing::info!(
            prescription_id = %prescription.id,
            tracking_number = %delivered.tracking_number,
            "Prescription delivered"
        );
        Ok(())
    }
}

impl<C: Cache + 'static> Handler for DeliveryConfirmationStage<C> {
    fn topic(&self) -> &str {
        topics::SHIPMENT_DELIVERED
    }

    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(self.run(message))
    }
}
