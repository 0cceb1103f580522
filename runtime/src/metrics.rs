//! Prometheus metrics for the worker.
//!
//! This module provides metric collection for:
//! - The consumer loop (consumed, processed, failed, unroutable, polls)
//! - Dead-letter publishing
//! - Intake outcomes and coordination fail-open events
//! - Retries
//!
//! # Example
//!
//! ```rust,no_run
//! use pharmonico_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://0.0.0.0:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter with its own HTTP listener.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the exporter listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Install the global recorder and start the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder installed earlier (e.g., by another test) is kept; the call
    /// then succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if let Err(e) = exporter.await {
                        tracing::error!(error = ?e, "Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics exporter started");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Consumer loop
    describe_counter!(
        "pharmonico_messages_consumed_total",
        "Messages pulled from the broker"
    );
    describe_counter!(
        "pharmonico_messages_processed_total",
        "Messages handled successfully"
    );
    describe_counter!(
        "pharmonico_handler_failures_total",
        "Messages whose handler returned an error or panicked"
    );
    describe_counter!(
        "pharmonico_messages_unroutable_total",
        "Messages on a topic without a handler"
    );
    describe_counter!(
        "pharmonico_poll_errors_total",
        "Failed broker polls"
    );
    describe_counter!(
        "pharmonico_commit_errors_total",
        "Failed offset commits"
    );
    describe_counter!(
        "pharmonico_batches_total",
        "Batches pulled in batch mode"
    );
    describe_histogram!(
        "pharmonico_batch_size",
        "Messages per batch"
    );
    describe_histogram!(
        "pharmonico_handler_duration_seconds",
        "Time taken by one handler invocation"
    );

    // Dead letters
    describe_counter!(
        "pharmonico_dead_letters_total",
        "Dead-letter records published"
    );
    describe_counter!(
        "pharmonico_dead_letter_failures_total",
        "Dead-letter records that could not be published"
    );

    // Intake
    describe_counter!(
        "pharmonico_intake_total",
        "Intake submissions by outcome"
    );
    describe_counter!(
        "pharmonico_coordination_fail_open_total",
        "Coordination calls that failed and were bypassed"
    );

    // Retry
    describe_counter!(
        "pharmonico_retry_attempts_total",
        "Retries scheduled"
    );
    describe_counter!(
        "pharmonico_retry_successes_total",
        "Operations that succeeded after retrying"
    );
    describe_counter!(
        "pharmonico_retry_exhausted_total",
        "Operations that ran out of retries"
    );
}

/// Consumer loop metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a pulled message.
    pub fn record_consumed(topic: &str) {
        counter!("pharmonico_messages_consumed_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a successful handler run.
    pub fn record_processed(topic: &str, duration: Duration) {
        counter!("pharmonico_messages_processed_total", "topic" => topic.to_string()).increment(1);
        histogram!("pharmonico_handler_duration_seconds", "topic" => topic.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a failed handler run.
    pub fn record_failure(topic: &str, duration: Duration) {
        counter!("pharmonico_handler_failures_total", "topic" => topic.to_string()).increment(1);
        histogram!("pharmonico_handler_duration_seconds", "topic" => topic.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a message without a handler.
    pub fn record_unroutable(topic: &str) {
        counter!("pharmonico_messages_unroutable_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a failed poll.
    pub fn record_poll_error() {
        counter!("pharmonico_poll_errors_total").increment(1);
    }

    /// Record a failed commit.
    pub fn record_commit_error() {
        counter!("pharmonico_commit_errors_total").increment(1);
    }

    /// Record one batch of `size` messages.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_batch(size: usize) {
        counter!("pharmonico_batches_total").increment(1);
        histogram!("pharmonico_batch_size").record(size as f64);
    }
}

/// Dead-letter metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// Record a dead-letter attempt for a message from `topic`.
    pub fn record(topic: &str, published: bool) {
        if published {
            counter!("pharmonico_dead_letters_total", "topic" => topic.to_string()).increment(1);
        } else {
            counter!("pharmonico_dead_letter_failures_total", "topic" => topic.to_string())
                .increment(1);
        }
    }
}

/// Intake metrics recorder.
pub struct IntakeMetrics;

impl IntakeMetrics {
    /// Record a submission outcome (`accepted`, `duplicate`, `rate_limited`, `failed`).
    pub fn record_outcome(outcome: &'static str) {
        counter!("pharmonico_intake_total", "outcome" => outcome).increment(1);
    }

    /// Record a coordination call bypassed by fail-open.
    pub fn record_fail_open(primitive: &'static str) {
        counter!("pharmonico_coordination_fail_open_total", "primitive" => primitive).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("pharmonico_retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("pharmonico_retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("pharmonico_retry_exhausted_total").increment(1);
    }
}
