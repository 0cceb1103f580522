//! `validation.completed` → `enrollment.completed`

use crate::context::{Progress, StageContext, record, record_progress, recorded};
use pharmonico_core::broker::BrokerMessage;
use pharmonico_core::handler::{Handler, HandlerContext, HandlerError, HandlerFuture};
use pharmonico_core::payloads::{EnrollmentCompleted, ValidationCompleted};
use pharmonico_core::prescription::PrescriptionStatus;
use pharmonico_core::topics;

const STAGE: &str = "enrollment";

/// Enrolls the patient in the dispensing program.
#[derive(Debug, Clone)]
pub struct EnrollmentStage {
    ctx: StageContext,
}

impl EnrollmentStage {
    /// Create the stage.
    #[must_use]
    pub const fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    async fn run(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let (envelope, validated) = StageContext::decode::<ValidationCompleted>(&message.value)?;
        let mut prescription = self.ctx.load(&envelope).await?;

        let progress = Progress::of(prescription.status, PrescriptionStatus::Enrolled);
        record_progress(STAGE, progress);
        let payload = match progress {
            Progress::Skip => return Ok(()),
            Progress::Replay => recorded::<EnrollmentCompleted>(&prescription, STAGE)?,
            Progress::Fresh => {
                let now = self.ctx.now();
                let payload = EnrollmentCompleted {
                    patient_id: validated.patient_id,
                    enrolled_at: now,
                };
                prescription.advance(PrescriptionStatus::Enrolled, now);
                record(&mut prescription, STAGE, &payload)?;
                self.ctx.save(&prescription).await?;
                tracing::info!(
                    prescription_id = %prescription.id,
                    patient_id = %payload.patient_id,
                    "Patient enrolled"
                );
                payload
            },
        };

        self.ctx
            .emit(topics::ENROLLMENT_COMPLETED, &envelope, &payload)
            .await
    }
}

impl Handler for EnrollmentStage {
    fn topic(&self) -> &str {
        topics::VALIDATION_COMPLETED
    }

    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(self.run(message))
    }
}
