//! Topic vocabulary for the prescription workflow.
//!
//! Handlers are routed by exact string match on these names. The set is fixed:
//! adding a stage means adding a constant here and a handler that consumes it.

/// Intake accepted a prescription and persisted it as `received`.
pub const INTAKE_RECEIVED: &str = "intake.received";

/// Validation finished and the prescription is valid.
pub const VALIDATION_COMPLETED: &str = "validation.completed";

/// Patient enrollment finished.
pub const ENROLLMENT_COMPLETED: &str = "enrollment.completed";

/// A fulfilling pharmacy was chosen.
pub const PHARMACY_SELECTED: &str = "pharmacy.selected";

/// Insurance adjudication finished.
pub const ADJUDICATION_COMPLETED: &str = "adjudication.completed";

/// A patient payment link was issued.
pub const PAYMENT_LINK_CREATED: &str = "payment.link.created";

/// Payment was captured or waived.
pub const PAYMENT_COMPLETED: &str = "payment.completed";

/// A shipping label was created.
pub const SHIPMENT_LABEL_CREATED: &str = "shipment.label.created";

/// The carrier confirmed delivery.
pub const SHIPMENT_DELIVERED: &str = "shipment.delivered";

/// Messages that could not be routed or handled.
pub const DEAD_LETTER_QUEUE: &str = "dead_letter_queue";

/// Workflow topics in stage order.
pub const WORKFLOW: [&str; 9] = [
    INTAKE_RECEIVED,
    VALIDATION_COMPLETED,
    ENROLLMENT_COMPLETED,
    PHARMACY_SELECTED,
    ADJUDICATION_COMPLETED,
    PAYMENT_LINK_CREATED,
    PAYMENT_COMPLETED,
    SHIPMENT_LABEL_CREATED,
    SHIPMENT_DELIVERED,
];

/// Returns `true` if `topic` is part of the fixed vocabulary.
#[must_use]
pub fn is_known(topic: &str) -> bool {
    topic == DEAD_LETTER_QUEUE || WORKFLOW.contains(&topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn workflow_topics_are_unique() {
        let unique: HashSet<_> = WORKFLOW.iter().collect();
        assert_eq!(unique.len(), WORKFLOW.len());
        assert!(!WORKFLOW.contains(&DEAD_LETTER_QUEUE));
    }

    #[test]
    fn workflow_starts_at_intake() {
        assert_eq!(WORKFLOW[0], INTAKE_RECEIVED);
        assert_eq!(WORKFLOW[WORKFLOW.len() - 1], SHIPMENT_DELIVERED);
    }

    #[test]
    fn known_topics_match_exactly() {
        assert!(is_known("pharmacy.selected"));
        assert!(is_known("dead_letter_queue"));
        assert!(!is_known("Pharmacy.Selected"));
        assert!(!is_known("pharmacy.selected "));
    }
}
