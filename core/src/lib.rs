//! # Pharmonico Core
//!
//! Contracts for the event-driven prescription workflow.
//!
//! A prescription enters at intake, then each stage consumes one topic,
//! updates the prescription document, and emits the envelope that triggers
//! the next stage:
//!
//! ```text
//! intake.received → validation.completed → enrollment.completed
//!   → pharmacy.selected → adjudication.completed
//!   → payment.completed | payment.link.created
//!   → shipment.label.created → shipment.delivered
//! ```
//!
//! ## Modules
//!
//! - [`envelope`]: the message shape and correlation propagation
//! - [`broker`]: producer/consumer contract
//! - [`handler`] and [`registry`]: stage contract and topic dispatch
//! - [`dead_letter`]: where unroutable and failed messages go
//! - [`cache`] and [`coordination`]: deduplication, rate limiting, capacity
//! - [`prescription`]: the workflow document and its store
//! - [`payloads`]: typed payload per topic
//!
//! Delivery is at-least-once; every stage is written to be replay-safe.

pub mod broker;
pub mod cache;
pub mod coordination;
pub mod dead_letter;
pub mod envelope;
pub mod environment;
pub mod handler;
pub mod payloads;
pub mod prescription;
pub mod registry;
pub mod topics;

// Re-export commonly used types
pub use broker::{BrokerError, BrokerMessage, Consumer, Producer};
pub use cache::{Cache, CacheError};
pub use coordination::{CoordinationError, FailOpen};
pub use dead_letter::{DeadLetterRecord, DeadLetterSink};
pub use envelope::{Envelope, EnvelopeError, extract_correlation_id};
pub use environment::{Clock, SystemClock};
pub use handler::{Handler, HandlerContext, HandlerError, HandlerFuture};
pub use prescription::{Prescription, PrescriptionStatus, PrescriptionStore, StoreError};
pub use registry::{HandlerRegistry, RegistryError};
