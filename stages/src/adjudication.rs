//! `pharmacy.selected` → `adjudication.completed`

use crate::context::{Progress, StageContext, record, record_progress, recorded};
use pharmonico_core::broker::BrokerMessage;
use pharmonico_core::handler::{Handler, HandlerContext, HandlerError, HandlerFuture};
use pharmonico_core::payloads::{AdjudicationCompleted, AdjudicationResult, PharmacySelected};
use pharmonico_core::prescription::PrescriptionStatus;
use pharmonico_core::topics;

const STAGE: &str = "adjudication";

/// Simulated plan response applied to every claim.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjudicationPolicy {
    /// Patient share
    pub copay_amount: f64,
    /// Plan share
    pub insurance_pays: f64,
}

impl AdjudicationPolicy {
    /// Approved claim under this policy.
    #[must_use]
    pub fn adjudicate(&self) -> AdjudicationResult {
        AdjudicationResult {
            status: "approved".to_string(),
            copay_amount: self.copay_amount,
            insurance_pays: self.insurance_pays,
            total_cost: self.copay_amount + self.insurance_pays,
        }
    }
}

impl Default for AdjudicationPolicy {
    fn default() -> Self {
        Self {
            copay_amount: 25.0,
            insurance_pays: 175.0,
        }
    }
}

/// Adjudicates the claim against the patient's plan.
#[derive(Debug, Clone)]
pub struct AdjudicationStage {
    ctx: StageContext,
    policy: AdjudicationPolicy,
}

impl AdjudicationStage {
    /// Create the stage.
    #[must_use]
    pub const fn new(ctx: StageContext, policy: AdjudicationPolicy) -> Self {
        Self { ctx, policy }
    }

    async fn run(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let (envelope, selected) = StageContext::decode::<PharmacySelected>(&message.value)?;
        let mut prescription = self.ctx.load(&envelope).await?;

        let progress = Progress::of(prescription.status, PrescriptionStatus::Adjudicated);
        record_progress(STAGE, progress);
        let payload = match progress {
            Progress::Skip => return Ok(()),
            Progress::Replay => recorded::<AdjudicationCompleted>(&prescription, STAGE)?,
            Progress::Fresh => {
                let now = self.ctx.now();
                let payload = AdjudicationCompleted {
                    patient_id: selected.patient_id,
                    pharmacy_id: selected.pharmacy_id,
                    adjudication_result: self.policy.adjudicate(),
                    adjudicated_at: now,
                };
                prescription.advance(PrescriptionStatus::Adjudicated, now);
                record(&mut prescription, STAGE, &payload)?;
                self.ctx.save(&prescription).await?;
                tracing::info!(
                    prescription_id = %prescription.id,
                    copay = payload.adjudication_result.copay_amount,
                    total = payload.adjudication_result.total_cost,
                    "Claim adjudicated"
                );
                payload
            },
        };

        self.ctx
            .emit(topics::ADJUDICATION_COMPLETED, &envelope, &payload)
            .await
    }
}

impl Handler for AdjudicationStage {
    fn topic(&self) -> &str {
        topics::PHARMACY_SELECTED
    }

    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(self.run(message))
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_approves_with_copay() {
        let result = AdjudicationPolicy::default().adjudicate();
        assert_eq!(result.status, "approved");
        assert_eq!(result.copay_amount, 25.0);
        assert_eq!(result.insurance_pays, 175.0);
        assert_eq!(result.total_cost, 200.0);
        assert!(!result.is_fully_covered());
    }
}
