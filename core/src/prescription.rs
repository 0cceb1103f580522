//! The prescription document and its store.
//!
//! A prescription moves forward through a fixed sequence of statuses. Each
//! status has a rank; [`Prescription::advance`] refuses to move to a status
//! whose rank is not higher than the current one, which is what makes stage
//! handlers safe to replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;

/// Workflow status of a prescription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrescriptionStatus {
    /// Accepted at intake
    Received,
    /// Passed validation
    Validated,
    /// Failed validation (terminal)
    ValidationFailed,
    /// Patient enrolled
    Enrolled,
    /// Pharmacy chosen
    PharmacySelected,
    /// Insurance adjudicated
    Adjudicated,
    /// Waiting for the patient to pay
    AwaitingPayment,
    /// No copay due
    PaymentWaived,
    /// Label created and handed to the carrier
    Shipped,
    /// Carrier has the package
    InTransit,
    /// Delivered to the patient (terminal)
    Delivered,
}

impl PrescriptionStatus {
    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::ValidationFailed => "validation_failed",
            Self::Enrolled => "enrolled",
            Self::PharmacySelected => "pharmacy_selected",
            Self::Adjudicated => "adjudicated",
            Self::AwaitingPayment => "awaiting_payment",
            Self::PaymentWaived => "payment_waived",
            Self::Shipped => "shipped",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
        }
    }

    /// Position in the workflow. Alternatives at the same step share a rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Validated | Self::ValidationFailed => 1,
            Self::Enrolled => 2,
            Self::PharmacySelected => 3,
            Self::Adjudicated => 4,
            Self::AwaitingPayment | Self::PaymentWaived => 5,
            Self::Shipped => 6,
            Self::InTransit => 7,
            Self::Delivered => 8,
        }
    }

    /// No stage moves a prescription out of this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ValidationFailed | Self::Delivered)
    }
}

impl fmt::Display for PrescriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrescriptionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "validated" => Ok(Self::Validated),
            "validation_failed" => Ok(Self::ValidationFailed),
            "enrolled" => Ok(Self::Enrolled),
            "pharmacy_selected" => Ok(Self::PharmacySelected),
            "adjudicated" => Ok(Self::Adjudicated),
            "awaiting_payment" => Ok(Self::AwaitingPayment),
            "payment_waived" => Ok(Self::PaymentWaived),
            "shipped" => Ok(Self::Shipped),
            "in_transit" => Ok(Self::InTransit),
            "delivered" => Ok(Self::Delivered),
            _ => Err(StoreError::Serialization(format!(
                "Invalid prescription status: {s}"
            ))),
        }
    }
}

/// Patient reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    /// Patient id; may be empty on inbound documents
    #[serde(default)]
    pub id: String,
    /// Given name
    #[serde(default)]
    pub first_name: String,
    /// Family name
    #[serde(default)]
    pub last_name: String,
    /// `YYYY-MM-DD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
}

/// Prescriber reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prescriber {
    /// Prescriber id
    #[serde(default)]
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// National Provider Identifier
    #[serde(default)]
    pub npi: String,
}

/// Prescribed drug.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medication {
    /// National Drug Code
    #[serde(default)]
    pub ndc: String,
    /// Drug name
    #[serde(default)]
    pub name: String,
    /// Dispensed quantity
    #[serde(default)]
    pub quantity: u32,
}

/// The prescription document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    /// Prescription id (the workflow subject id)
    pub id: String,
    /// Current status
    pub status: PrescriptionStatus,
    /// Patient
    pub patient: Patient,
    /// Prescriber
    pub prescriber: Prescriber,
    /// Drug
    pub medication: Medication,
    /// `YYYY-MM-DD`; may be empty
    #[serde(default)]
    pub date_written: String,
    /// Pharmacy chosen by routing
    #[serde(default)]
    pub pharmacy_id: Option<String>,
    /// Problems found by validation
    #[serde(default)]
    pub validation_errors: Vec<String>,
    /// Stage results keyed by stage (`adjudication`, `payment`, `shipment`)
    #[serde(default)]
    pub details: Map<String, Value>,
    /// First persisted
    pub created_at: DateTime<Utc>,
    /// Last persisted
    pub updated_at: DateTime<Utc>,
}

impl Prescription {
    /// New document in status `received`.
    #[must_use]
    pub fn received(
        id: impl Into<String>,
        patient: Patient,
        prescriber: Prescriber,
        medication: Medication,
        date_written: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            status: PrescriptionStatus::Received,
            patient,
            prescriber,
            medication,
            date_written: date_written.into(),
            pharmacy_id: None,
            validation_errors: Vec::new(),
            details: Map::new(),
            created_at: at,
            updated_at: at,
        }
    }

    /// Move to `status` if it is further along than the current status.
    ///
    /// Returns `false` (and changes nothing) for a replayed or stale transition.
    pub fn advance(&mut self, status: PrescriptionStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || status.rank() <= self.status.rank() {
            return false;
        }
        self.status = status;
        self.updated_at = at;
        true
    }

    /// Whether the prescription is at or past `status`'s step.
    #[must_use]
    pub const fn has_reached(&self, status: PrescriptionStatus) -> bool {
        self.status.rank() >= status.rank()
    }

    /// Record a stage result under `stage`.
    pub fn set_detail(&mut self, stage: &str, value: Value) {
        self.details.insert(stage.to_string(), value);
    }
}

/// Errors from prescription stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database failed the query
    #[error("Database error: {0}")]
    Database(String),

    /// A stored document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Boxed future returned by [`PrescriptionStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Document store for prescriptions.
///
/// # Implementations
///
/// - `PostgresPrescriptionStore` in `pharmonico-postgres` (JSONB documents)
/// - `InMemoryPrescriptionStore` in `pharmonico-testing`
pub trait PrescriptionStore: Send + Sync {
    /// Insert or replace the document with `prescription.id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn save<'a>(&'a self, prescription: &'a Prescription) -> StoreFuture<'a, ()>;

    /// Load a document by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or the document is corrupt.
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Prescription>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ALL: [PrescriptionStatus; 11] = [
        PrescriptionStatus::Received,
        PrescriptionStatus::Validated,
        PrescriptionStatus::ValidationFailed,
        PrescriptionStatus::Enrolled,
        PrescriptionStatus::PharmacySelected,
        PrescriptionStatus::Adjudicated,
        PrescriptionStatus::AwaitingPayment,
        PrescriptionStatus::PaymentWaived,
        PrescriptionStatus::Shipped,
        PrescriptionStatus::InTransit,
        PrescriptionStatus::Delivered,
    ];

    fn sample() -> Prescription {
        Prescription::received(
            "rx_1",
            Patient {
                id: "p1".to_string(),
                ..Patient::default()
            },
            Prescriber::default(),
            Medication::default(),
            "2025-01-01",
            DateTime::<Utc>::default(),
        )
    }

    #[test]
    fn status_strings_parse_back() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<PrescriptionStatus>().unwrap(), status);
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
        }
        assert!("shipping".parse::<PrescriptionStatus>().is_err());
    }

    #[test]
    fn advance_only_moves_forward() {
        let mut rx = sample();
        assert!(rx.advance(PrescriptionStatus::Validated, Utc::now()));
        assert!(!rx.advance(PrescriptionStatus::Validated, Utc::now()));
        assert!(!rx.advance(PrescriptionStatus::Received, Utc::now()));
        assert!(rx.advance(PrescriptionStatus::PharmacySelected, Utc::now()));
        assert_eq!(rx.status, PrescriptionStatus::PharmacySelected);
    }

    #[test]
    fn terminal_statuses_stick() {
        let mut rx = sample();
        assert!(rx.advance(PrescriptionStatus::ValidationFailed, Utc::now()));
        assert!(!rx.advance(PrescriptionStatus::Enrolled, Utc::now()));
        assert_eq!(rx.status, PrescriptionStatus::ValidationFailed);
    }

    #[test]
    fn has_reached_compares_ranks() {
        let mut rx = sample();
        rx.advance(PrescriptionStatus::PaymentWaived, Utc::now());
        assert!(rx.has_reached(PrescriptionStatus::AwaitingPayment));
        assert!(!rx.has_reached(PrescriptionStatus::Shipped));
    }
}
