//! `adjudication.completed` → `payment.completed` | `payment.link.created`
//!
//! A fully covered claim skips payment and continues straight to shipping.
//! Otherwise the patient gets a payment link and the workflow waits for the
//! payment provider to publish `payment.completed`.

use crate::context::{Progress, StageContext, record, record_progress, recorded};
use pharmonico_core::broker::BrokerMessage;
use pharmonico_core::handler::{Handler, HandlerContext, HandlerError, HandlerFuture};
use pharmonico_core::payloads::{AdjudicationCompleted, PaymentCompleted, PaymentLinkCreated};
use pharmonico_core::prescription::PrescriptionStatus;
use pharmonico_core::topics;
use uuid::Uuid;

const STAGE: &str = "payment";

/// Default host of generated payment links.
pub const DEFAULT_PAYMENT_LINK_BASE_URL: &str = "https://pay.pharmonico.com";

/// Collects the copay, or waives it.
#[derive(Debug, Clone)]
pub struct PaymentStage {
    ctx: StageContext,
    link_base_url: String,
}

impl PaymentStage {
    /// Create the stage; links are issued under `link_base_url`.
    #[must_use]
    pub fn new(ctx: StageContext, link_base_url: impl Into<String>) -> Self {
        Self {
            ctx,
            link_base_url: link_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn run(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let (envelope, adjudicated) =
            StageContext::decode::<AdjudicationCompleted>(&message.value)?;
        let mut prescription = self.ctx.load(&envelope).await?;

        let waived = adjudicated.adjudication_result.is_fully_covered();
        let target = if waived {
            PrescriptionStatus::PaymentWaived
        } else {
            PrescriptionStatus::AwaitingPayment
        };
        let progress = Progress::of(prescription.status, target);
        record_progress(STAGE, progress);
        if progress == Progress::Skip {
            return Ok(());
        }

        let now = self.ctx.now();
        if waived {
            let payload = if progress == Progress::Replay {
                recorded::<PaymentCompleted>(&prescription, STAGE)?
            } else {
                let payload = PaymentCompleted {
                    patient_id: adjudicated.patient_id,
                    amount: 0.0,
                    status: "waived".to_string(),
                    completed_at: now,
                };
                prescription.advance(target, now);
                record(&mut prescription, STAGE, &payload)?;
                self.ctx.save(&prescription).await?;
                tracing::info!(prescription_id = %prescription.id, "Copay waived");
                payload
            };
            return self
                .ctx
                .emit(topics::PAYMENT_COMPLETED, &envelope, &payload)
                .await;
        }

        let payload = if progress == Progress::Replay {
            recorded::<PaymentLinkCreated>(&prescription, STAGE)?
        } else {
            let link_id = Uuid::new_v4().to_string();
            let payload = PaymentLinkCreated {
                patient_id: adjudicated.patient_id,
                payment_link_url: format!("{}/{link_id}", self.link_base_url),
                payment_link_id: link_id,
                amount: adjudicated.adjudication_result.copay_amount,
                created_at: now,
            };
            prescription.advance(target, now);
            record(&mut prescription, STAGE, &payload)?;
            self.ctx.save(&prescription).await?;
            tracing::info!(
                prescription_id = %prescription.id,
                payment_link_id = %payload.payment_link_id,
                amount = payload.amount,
                "Payment link created"
            );
            payload
        };
        self.ctx
            .emit(topics::PAYMENT_LINK_CREATED, &envelope, &payload)
            .await
    }
}

impl Handler for PaymentStage {
    fn topic(&self) -> &str {
        topics::ADJUDICATION_COMPLETED
    }

    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(self.run(message))
    }
}
