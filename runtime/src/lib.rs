//! # Pharmonico Runtime
//!
//! The moving parts of a worker process.
//!
//! ## Core Components
//!
//! - **Consumer loop** ([`consumer`]): subscribe, pull, dispatch, dead-letter, commit
//! - **Intake** ([`intake`]): rate limit, deduplicate, store, and publish new prescriptions
//! - **Retry** ([`retry`]): backoff policies for transient infrastructure errors
//! - **Shutdown** ([`shutdown`]): one signal observed by every task
//! - **Metrics** ([`metrics`]): Prometheus exporter and recorders
//!
//! ## Example
//!
//! ```ignore
//! use pharmonico_runtime::{ConsumerConfig, ShutdownSignal, WorkflowConsumer};
//!
//! let signal = ShutdownSignal::new();
//! let mut consumer = WorkflowConsumer::new(kafka, registry, sink, ConsumerConfig::single());
//! let report = consumer.run(signal.subscribe()).await?;
//! ```

pub mod consumer;
pub mod intake;
pub mod metrics;
pub mod retry;
pub mod shutdown;

pub use consumer::{
    ConsumerConfig, ConsumerError, ConsumerReport, ConsumerState, PollMode, WorkflowConsumer,
};
pub use intake::{IntakeConfig, IntakeError, IntakeOutcome, IntakeRequest, IntakeService};
pub use retry::RetryPolicy;
pub use shutdown::ShutdownSignal;
