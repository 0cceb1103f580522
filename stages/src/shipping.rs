//! `payment.completed` → `shipment.label.created`

use crate::context::{Progress, StageContext, record, record_progress, recorded};
use pharmonico_core::broker::BrokerMessage;
use pharmonico_core::handler::{Handler, HandlerContext, HandlerError, HandlerFuture};
use pharmonico_core::payloads::{PaymentCompleted, ShipmentLabelCreated};
use pharmonico_core::prescription::PrescriptionStatus;
use pharmonico_core::topics;
use uuid::Uuid;

const STAGE: &str = "shipment";

/// Default host of generated labels.
pub const DEFAULT_LABEL_BASE_URL: &str = "https://labels.pharmonico.com";

/// Default carrier written on labels.
pub const DEFAULT_CARRIER: &str = "USPS";

/// `TRK` followed by twelve uppercase hex digits.
#[must_use]
pub fn tracking_number() -> String {
    let random: String = Uuid::new_v4().simple().to_string().chars().take(12).collect();
    format!("TRK{}", random.to_uppercase())
}

/// Buys a shipping label once the copay is settled.
#[derive(Debug, Clone)]
pub struct ShippingStage {
    ctx: StageContext,
    label_base_url: String,
    carrier: String,
}

impl ShippingStage {
    /// Create the stage.
    #[must_use]
    pub fn new(
        ctx: StageContext,
        label_base_url: impl Into<String>,
        carrier: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            label_base_url: label_base_url.into().trim_end_matches('/').to_string(),
            carrier: carrier.into(),
        }
    }

    async fn run(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let (envelope, payment) = StageContext::decode::<PaymentCompleted>(&message.value)?;
        let mut prescription = self.ctx.load(&envelope).await?;

        let progress = Progress::of(prescription.status, PrescriptionStatus::Shipped);
        record_progress(STAGE, progress);
        let payload = match progress {
            Progress::Skip => return Ok(()),
            Progress::Replay => recorded::<ShipmentLabelCreated>(&prescription, STAGE)?,
            Progress::Fresh => {
                let now = self.ctx.now();
                let tracking_number = tracking_number();
                let payload = ShipmentLabelCreated {
                    patient_id: payment.patient_id,
                    label_url: format!("{}/{tracking_number}", self.label_base_url),
                    tracking_number,
                    carrier: self.carrier.clone(),
                    label_created_at: now,
                };
                prescription.advance(PrescriptionStatus::Shipped, now);
                record(&mut prescription, STAGE, &payload)?;
                self.ctx.save(&prescription).await?;
                tracing::info!(
                    prescription_id = %prescription.id,
                    tracking_number = %payload.tracking_number,
                    payment_status = %payment.status,
                    "Shipping label created"
                );
                payload
            },
        };

        self.ctx
            .emit(topics::SHIPMENT_LABEL_CREATED, &envelope, &payload)
            .await
    }
}

impl Handler for ShippingStage {
    fn topic(&self) -> &str {
        topics::PAYMENT_COMPLETED
    }

    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(self.run(message))
    }
}
