//! Typed payloads, one per workflow topic.
//!
//! Envelopes carry an open map on the wire; stages decode it into these
//! structs with [`Envelope::payload_as`](crate::envelope::Envelope::payload_as)
//! and build successors with
//! [`Envelope::typed_successor`](crate::envelope::Envelope::typed_successor).
//! Unknown fields are ignored, so producers may add fields freely.

use crate::prescription::{Medication, Patient, Prescriber, PrescriptionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `intake.received`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeReceived {
    /// Always `received`
    pub status: PrescriptionStatus,
    /// Patient reference
    pub patient: Patient,
    /// Prescriber reference
    pub prescriber: Prescriber,
    /// Prescribed medication
    pub medication: Medication,
    /// Date written as submitted
    #[serde(default)]
    pub date_written: String,
    /// When intake stored the prescription
    pub created_at: DateTime<Utc>,
}

/// `validation.completed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCompleted {
    /// Patient id
    pub patient_id: String,
    /// Validation time
    pub validated_at: DateTime<Utc>,
}

/// `enrollment.completed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentCompleted {
    /// Patient id
    pub patient_id: String,
    /// Enrollment time
    pub enrolled_at: DateTime<Utc>,
}

/// `pharmacy.selected`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PharmacySelected {
    /// Patient id
    pub patient_id: String,
    /// Chosen pharmacy
    pub pharmacy_id: String,
    /// NCPDP id of the chosen pharmacy
    pub pharmacy_ncpdp_id: String,
    /// Selection time
    pub selected_at: DateTime<Utc>,
}

/// Outcome of insurance adjudication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationResult {
    /// `approved` or `rejected`
    pub status: String,
    /// Amount owed by the patient
    pub copay_amount: f64,
    /// Amount covered by the plan
    pub insurance_pays: f64,
    /// Full cost
    pub total_cost: f64,
}

impl AdjudicationResult {
    /// Whether the patient owes nothing.
    #[must_use]
    pub fn is_fully_covered(&self) -> bool {
        self.copay_amount <= 0.0
    }
}

/// `adjudication.completed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationCompleted {
    /// Patient id
    pub patient_id: String,
    /// Dispensing pharmacy
    pub pharmacy_id: String,
    /// Adjudication outcome
    pub adjudication_result: AdjudicationResult,
    /// Adjudication time
    pub adjudicated_at: DateTime<Utc>,
}

/// `payment.link.created`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentLinkCreated {
    /// Patient id
    pub patient_id: String,
    /// Payment link id
    pub payment_link_id: String,
    /// URL sent to the patient
    pub payment_link_url: String,
    /// Amount due
    pub amount: f64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// `payment.completed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    /// Patient id
    pub patient_id: String,
    /// Amount paid
    pub amount: f64,
    /// `paid` or `waived`
    pub status: String,
    /// Completion time
    pub completed_at: DateTime<Utc>,
}

/// `shipment.label.created`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentLabelCreated {
    /// Patient id
    pub patient_id: String,
    /// Carrier tracking number
    pub tracking_number: String,
    /// Printable label
    pub label_url: String,
    /// Carrier name
    pub carrier: String,
    /// Label creation time
    pub label_created_at: DateTime<Utc>,
}

/// `shipment.delivered`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentDelivered {
    /// Carrier tracking number
    #[serde(default)]
    pub tracking_number: String,
    /// Delivery time
    pub delivered_at: DateTime<Utc>,
}
