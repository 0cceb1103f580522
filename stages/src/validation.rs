//! `intake.received` → `validation.completed`

use crate::context::{Progress, StageContext, record, record_progress, recorded};
use pharmonico_core::broker::BrokerMessage;
use pharmonico_core::handler::{Handler, HandlerContext, HandlerError, HandlerFuture};
use pharmonico_core::payloads::{IntakeReceived, ValidationCompleted};
use pharmonico_core::prescription::{Prescription, PrescriptionStatus};
use pharmonico_core::topics;

const STAGE: &str = "validation";

/// Problems that keep a prescription from entering the workflow.
#[must_use]
pub fn validate(prescription: &Prescription) -> Vec<String> {
    let mut errors = Vec::new();
    if prescription.patient.id.trim().is_empty() {
        errors.push("patient_id is required".to_string());
    }
    if prescription.prescriber.id.trim().is_empty() {
        errors.push("prescriber_id is required".to_string());
    }
    if prescription.medication.ndc.trim().is_empty() {
        errors.push("medication ndc is required".to_string());
    }
    errors
}

/// Checks required fields. A valid prescription moves to `validated` and
/// continues; an invalid one stops at `validation_failed`.
#[derive(Debug, Clone)]
pub struct ValidationStage {
    ctx: StageContext,
}

impl ValidationStage {
    /// Create the stage.
    #[must_use]
    pub const fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    async fn run(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let (envelope, intake) = StageContext::decode::<IntakeReceived>(&message.value)?;
        let mut prescription = self.ctx.load(&envelope).await?;

        let progress = Progress::of(prescription.status, PrescriptionStatus::Validated);
        record_progress(STAGE, progress);
        match progress {
            Progress::Skip => {
                tracing::debug!(
                    prescription_id = %prescription.id,
                    status = %prescription.status,
                    "Validation already decided, skipping"
                );
                Ok(())
            },
            Progress::Replay => {
                let payload: ValidationCompleted = recorded(&prescription, STAGE)?;
                self.ctx
                    .emit(topics::VALIDATION_COMPLETED, &envelope, &payload)
                    .await
            },
            Progress::Fresh => {
                let now = self.ctx.now();
                let errors = validate(&prescription);
                if !errors.is_empty() {
                    prescription.advance(PrescriptionStatus::ValidationFailed, now);
                    prescription.validation_errors = errors;
                    self.ctx.save(&prescription).await?;
                    tracing::warn!(
                        prescription_id = %prescription.id,
                        ndc = %intake.medication.ndc,
                        errors = ?prescription.validation_errors,
                        "Prescription failed validation"
                    );
                    return Ok(());
                }

                let payload = ValidationCompleted {
                    patient_id: prescription.patient.id.clone(),
                    validated_at: now,
                };
                prescription.advance(PrescriptionStatus::Validated, now);
                prescription.validation_errors.clear();
                record(&mut prescription, STAGE, &payload)?;
                self.ctx.save(&prescription).await?;
                self.ctx
                    .emit(topics::VALIDATION_COMPLETED, &envelope, &payload)
                    .await?;

                tracing::info!(prescription_id = %prescription.id, "Prescription validated");
                Ok(())
            },
        }
    }
}

impl Handler for ValidationStage {
    fn topic(&self) -> &str {
        topics::INTAKE_RECEIVED
    }

    fn handle<'a>(&'a self, _ctx: &'a HandlerContext, message: &'a BrokerMessage) -> HandlerFuture<'a> {
        Box::pin(self.run(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use pharmonico_core::prescription::{Medication, Patient, Prescriber};
    use proptest::prelude::*;

    fn prescription() -> Prescription {
        Prescription::received(
            "rx_1",
            Patient {
                id: "p1".to_string(),
                ..Patient::default()
            },
            Prescriber {
                id: "dr-1".to_string(),
                ..Prescriber::default()
            },
            Medication {
                ndc: "00002-1234-01".to_string(),
                ..Medication::default()
            },
            "2025-01-01",
            DateTime::<Utc>::default(),
        )
    }

    #[test]
    fn complete_prescription_has_no_errors() {
        assert!(validate(&prescription()).is_empty());
    }

    #[test]
    fn every_missing_field_is_reported() {
        let mut rx = prescription();
        rx.patient.id = String::new();
        rx.prescriber.id = "  ".to_string();
        rx.medication.ndc = String::new();

        assert_eq!(
            validate(&rx),
            vec![
                "patient_id is required",
                "prescriber_id is required",
                "medication ndc is required",
            ]
        );
    }

    proptest! {
        #[test]
        fn blank_ids_are_always_reported(
            patient in "[ \t]{0,4}",
            prescriber in "[a-z0-9-]{1,12}",
        ) {
            let mut rx = prescription();
            rx.patient.id = patient;
            rx.prescriber.id = prescriber;
            prop_assert_eq!(validate(&rx), vec!["patient_id is required"]);
        }
    }
}
