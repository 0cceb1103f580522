//! The event envelope carried on every workflow topic.
//!
//! On the wire an envelope is a flat JSON object: the four reserved fields
//! (`event_id`, `correlation_id`, `prescription_id`, `timestamp`) sit next to the
//! stage-specific payload fields.
//!
//! ```text
//! {
//!   "event_id": "8f0c…",
//!   "correlation_id": "c1",
//!   "prescription_id": "rx_1",
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "patient_id": "p1",
//!   "validated_at": "2025-01-01T00:00:00Z"
//! }
//! ```
//!
//! The subject id is written as `prescription_id`; decoding also accepts
//! `subject_id`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

const EVENT_ID: &str = "event_id";
const CORRELATION_ID: &str = "correlation_id";
const PRESCRIPTION_ID: &str = "prescription_id";
const SUBJECT_ID: &str = "subject_id";
const TIMESTAMP: &str = "timestamp";

/// Field names owned by the envelope. Payload entries with these names are dropped.
pub const RESERVED_FIELDS: [&str; 5] = [EVENT_ID, CORRELATION_ID, PRESCRIPTION_ID, SUBJECT_ID, TIMESTAMP];

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The bytes are not a JSON object
    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    /// Neither `prescription_id` nor `subject_id` is present
    #[error("Envelope has no subject id")]
    MissingSubject,

    /// The timestamp is present but not RFC 3339
    #[error("Invalid envelope timestamp '{0}'")]
    InvalidTimestamp(String),

    /// The payload does not match the requested typed shape
    #[error("Failed to decode payload as {target}: {reason}")]
    Payload {
        /// Name of the target type
        target: &'static str,
        /// Underlying decode error
        reason: String,
    },

    /// The payload could not be encoded as a JSON object
    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

/// Generate a fresh correlation id.
#[must_use]
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Read the correlation id from raw message bytes.
///
/// Never fails: if the bytes are not JSON or carry no non-empty
/// `correlation_id`, a fresh id is generated so downstream logging always has one.
#[must_use]
pub fn extract_correlation_id(raw: &[u8]) -> String {
    serde_json::from_slice::<Value>(raw)
        .ok()
        .and_then(|value| {
            value
                .get(CORRELATION_ID)
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(new_correlation_id)
}

/// Immutable workflow message.
///
/// Construct with [`Envelope::create`] (or [`Envelope::create_at`] when the
/// caller owns a clock) and derive follow-up messages with
/// [`Envelope::successor`], which keeps the correlation and subject ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    event_id: String,
    correlation_id: String,
    subject_id: String,
    timestamp: DateTime<Utc>,
    payload: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope stamped with a new event id and the current time.
    #[must_use]
    pub fn create(
        correlation_id: impl Into<String>,
        subject_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self::create_at(correlation_id, subject_id, payload, Utc::now())
    }

    /// Create an envelope with an explicit emission time.
    ///
    /// Reserved keys in `payload` are discarded; an empty correlation id is
    /// replaced with a generated one.
    #[must_use]
    pub fn create_at(
        correlation_id: impl Into<String>,
        subject_id: impl Into<String>,
        mut payload: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        for field in RESERVED_FIELDS {
            payload.remove(field);
        }

        let correlation_id = correlation_id.into();
        let correlation_id = if correlation_id.is_empty() {
            new_correlation_id()
        } else {
            correlation_id
        };

        Self {
            event_id: Uuid::new_v4().to_string(),
            correlation_id,
            subject_id: subject_id.into(),
            timestamp,
            payload,
        }
    }

    /// Build an envelope from a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if `payload` does not serialize to a JSON object.
    pub fn from_typed<T: Serialize>(
        correlation_id: impl Into<String>,
        subject_id: impl Into<String>,
        payload: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => Ok(Self::create_at(correlation_id, subject_id, map, timestamp)),
            Ok(other) => Err(EnvelopeError::Encode(format!(
                "payload must be an object, got {other}"
            ))),
            Err(e) => Err(EnvelopeError::Encode(e.to_string())),
        }
    }

    /// Next envelope in the same workflow run (same correlation and subject ids).
    #[must_use]
    pub fn successor(&self, payload: Map<String, Value>, timestamp: DateTime<Utc>) -> Self {
        Self::create_at(
            self.correlation_id.clone(),
            self.subject_id.clone(),
            payload,
            timestamp,
        )
    }

    /// Typed successor, see [`Envelope::successor`].
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if `payload` does not serialize to a JSON object.
    pub fn typed_successor<T: Serialize>(
        &self,
        payload: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        Self::from_typed(
            self.correlation_id.clone(),
            self.subject_id.clone(),
            payload,
            timestamp,
        )
    }

    /// Decode an envelope from message bytes.
    ///
    /// A missing or empty `correlation_id` is synthesized, as is a missing
    /// `event_id`. A missing timestamp decodes as the current time.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::Decode`] if the bytes are not a JSON object
    /// - [`EnvelopeError::MissingSubject`] if there is no subject id
    /// - [`EnvelopeError::InvalidTimestamp`] if the timestamp does not parse
    pub fn decode(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let mut fields = match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(EnvelopeError::Decode("expected a JSON object".to_string())),
            Err(e) => return Err(EnvelopeError::Decode(e.to_string())),
        };

        let subject_id = take_string(&mut fields, PRESCRIPTION_ID)
            .or_else(|| take_string(&mut fields, SUBJECT_ID))
            .ok_or(EnvelopeError::MissingSubject)?;

        let event_id = take_string(&mut fields, EVENT_ID)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id =
            take_string(&mut fields, CORRELATION_ID).unwrap_or_else(new_correlation_id);

        let timestamp = match fields.remove(TIMESTAMP) {
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| EnvelopeError::InvalidTimestamp(raw))?,
            Some(other) => return Err(EnvelopeError::InvalidTimestamp(other.to_string())),
            None => Utc::now(),
        };

        for field in RESERVED_FIELDS {
            fields.remove(field);
        }

        Ok(Self {
            event_id,
            correlation_id,
            subject_id,
            timestamp,
            payload: fields,
        })
    }

    /// Encode as a flat JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(&self.to_value()).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// The wire representation as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = self.payload.clone();
        map.insert(EVENT_ID.to_string(), Value::String(self.event_id.clone()));
        map.insert(
            CORRELATION_ID.to_string(),
            Value::String(self.correlation_id.clone()),
        );
        map.insert(
            PRESCRIPTION_ID.to_string(),
            Value::String(self.subject_id.clone()),
        );
        map.insert(
            TIMESTAMP.to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        Value::Object(map)
    }

    /// Decode the payload into a stage-specific type.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Payload`] if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            EnvelopeError::Payload {
                target: std::any::type_name::<T>(),
                reason: e.to_string(),
            }
        })
    }

    /// Unique id of this emission.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Id shared by every envelope of one workflow run.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Prescription id; also the message key.
    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Emission time.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Stage-specific fields.
    #[must_use]
    pub const fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Look up one payload field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}
