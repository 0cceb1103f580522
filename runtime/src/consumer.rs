//! The consumer loop.
//!
//! [`WorkflowConsumer`] subscribes to every topic in the
//! [`HandlerRegistry`], pulls messages in single or batch mode, dispatches
//! each one to its handler, dead-letters what cannot be handled, and commits
//! the offset afterwards. Delivery is at-least-once: a crash between handling
//! and commit replays the message, which the stage handlers tolerate.
//!
//! ```text
//! Idle ──subscribe──▶ Subscribed ──▶ Running ──shutdown / closed──▶ Draining ──close──▶ Stopped
//! ```
//!
//! Shutdown is checked between messages (single mode) or between batches
//! (batch mode). A message that has reached its handler is always finished.

use crate::metrics::{ConsumerMetrics, DeadLetterMetrics};
use crate::shutdown;
use chrono::Utc;
use futures::FutureExt;
use pharmonico_core::broker::{BrokerError, BrokerMessage, Consumer};
use pharmonico_core::dead_letter::{DeadLetterSink, no_handler_reason};
use pharmonico_core::envelope::extract_correlation_id;
use pharmonico_core::handler::{HandlerContext, HandlerError};
use pharmonico_core::registry::HandlerRegistry;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

/// Default number of messages per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default time between batches.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(10);

/// Shortest time between batches; shorter intervals are raised to it.
pub const MIN_BATCH_INTERVAL: Duration = Duration::from_millis(1);

/// Default wait for one message.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Default pause after a failed poll.
pub const DEFAULT_POLL_BACKOFF: Duration = Duration::from_secs(1);

/// How messages are pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// One poll per iteration
    Single,
    /// Up to `batch_size` messages on every `interval` tick
    Batch {
        /// Maximum messages per batch
        batch_size: usize,
        /// Time between batches
        interval: Duration,
    },
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => f.write_str("single"),
            Self::Batch { .. } => f.write_str("batch"),
        }
    }
}

/// Consumer loop configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Pull mode
    pub mode: PollMode,
    /// Wait for one message (per pull in batch mode)
    pub poll_timeout: Duration,
    /// Pause after a failed poll
    pub poll_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            mode: PollMode::Single,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_backoff: DEFAULT_POLL_BACKOFF,
        }
    }
}

impl ConsumerConfig {
    /// Single mode with default timings.
    #[must_use]
    pub fn single() -> Self {
        Self::default()
    }

    /// Batch mode with default timings.
    ///
    /// A zero `batch_size` is raised to 1 and `interval` to at least
    /// [`MIN_BATCH_INTERVAL`].
    #[must_use]
    pub fn batch(batch_size: usize, interval: Duration) -> Self {
        Self {
            mode: PollMode::Batch {
                batch_size: batch_size.max(1),
                interval: interval.max(MIN_BATCH_INTERVAL),
            },
            ..Self::default()
        }
    }

    /// Set the per-message poll timeout.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the backoff after a failed poll.
    #[must_use]
    pub const fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }
}

/// Lifecycle of a [`WorkflowConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not started
    Idle,
    /// Subscribed, not yet pulling
    Subscribed,
    /// Pulling and dispatching
    Running,
    /// Closing the broker session
    Draining,
    /// Finished
    Stopped,
}

/// Counters for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Messages handled successfully
    pub processed: u64,
    /// Messages whose handler failed or panicked
    pub failed: u64,
    /// Messages on topics without a handler
    pub unroutable: u64,
    /// Dead-letter records that could not be published
    pub dead_letter_failures: u64,
    /// Failed polls
    pub poll_errors: u64,
    /// Failed commits
    pub commit_errors: u64,
    /// Batches pulled (batch mode)
    pub batches: u64,
}

/// Fatal consumer loop errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Subscribing to the registered topics failed
    #[error("Failed to subscribe: {0}")]
    Subscribe(#[source] BrokerError),
}

/// Dispatches broker messages to registered handlers.
pub struct WorkflowConsumer<C> {
    consumer: C,
    registry: Arc<HandlerRegistry>,
    sink: DeadLetterSink,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
}

impl<C: Consumer> WorkflowConsumer<C> {
    /// Create an idle loop.
    #[must_use]
    pub fn new(
        consumer: C,
        registry: Arc<HandlerRegistry>,
        sink: DeadLetterSink,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            consumer,
            registry,
            sink,
            config,
            state,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver observing lifecycle transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` fires or the broker session closes.
    ///
    /// With an empty registry the loop logs a warning and returns at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Subscribe`] if subscribing fails. Nothing
    /// after a successful subscribe is fatal.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerReport, ConsumerError> {
        let mut report = ConsumerReport::default();
        let topics: Vec<String> = self.registry.list_topics().into_iter().collect();

        if topics.is_empty() {
            tracing::warn!("No handlers registered, consumer loop has nothing to do");
            self.transition(ConsumerState::Stopped);
            return Ok(report);
        }

        if let Err(e) = self.consumer.subscribe(&topics).await {
            tracing::error!(topics = ?topics, error = %e, "Subscription failed");
            self.transition(ConsumerState::Stopped);
            return Err(ConsumerError::Subscribe(e));
        }
        self.transition(ConsumerState::Subscribed);
        tracing::info!(
            topics = ?topics,
            mode = %self.config.mode,
            "Consumer subscribed"
        );

        self.transition(ConsumerState::Running);
        match self.config.mode {
            PollMode::Single => self.run_single(&mut shutdown, &mut report).await,
            PollMode::Batch {
                batch_size,
                interval,
            } => {
                self.run_batch(&mut shutdown, &mut report, batch_size, interval)
                    .await;
            },
        }

        self.transition(ConsumerState::Draining);
        if let Err(e) = self.consumer.close().await {
            tracing::warn!(error = %e, "Failed to close consumer cleanly");
        }
        self.transition(ConsumerState::Stopped);

        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            unroutable = report.unroutable,
            poll_errors = report.poll_errors,
            "Consumer stopped"
        );
        Ok(report)
    }

    async fn run_single(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        report: &mut ConsumerReport,
    ) {
        let poll_timeout = self.config.poll_timeout;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                () = shutdown::requested(shutdown) => break,
                polled = self.consumer.poll(poll_timeout) => polled,
            };

            match polled {
                Ok(Some(message)) => self.process(message, shutdown, report).await,
                Ok(None) => {},
                Err(e) => {
                    if back_off(e, self.config.poll_backoff, shutdown, report).await {
                        break;
                    }
                },
            }
        }
    }

    async fn run_batch(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        report: &mut ConsumerReport,
        batch_size: usize,
        interval: Duration,
    ) {
        let poll_timeout = self.config.poll_timeout;
        // Also covers a hand-built `PollMode`.
        let batch_size = batch_size.max(1);
        if interval < MIN_BATCH_INTERVAL {
            tracing::warn!(
                interval_ms = interval.as_millis(),
                "Batch interval below minimum, raising it"
            );
        }
        let mut ticker = tokio::time::interval(interval.max(MIN_BATCH_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                () = shutdown::requested(shutdown) => break,
                _ = ticker.tick() => {},
            }

            match self.consumer.poll_batch(poll_timeout, batch_size).await {
                Ok(batch) => {
                    report.batches += 1;
                    ConsumerMetrics::record_batch(batch.len());
                    tracing::debug!(size = batch.len(), "Batch pulled");
                    for message in batch {
                        self.process(message, shutdown, report).await;
                    }
                },
                Err(e) => {
                    if back_off(e, self.config.poll_backoff, shutdown, report).await {
                        break;
                    }
                },
            }
        }
    }

    async fn process(
        &mut self,
        message: BrokerMessage,
        shutdown: &watch::Receiver<bool>,
        report: &mut ConsumerReport,
    ) {
        let correlation_id = extract_correlation_id(&message.value);
        let span = tracing::info_span!(
            "message",
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            correlation_id = %correlation_id,
        );

        async {
            ConsumerMetrics::record_consumed(&message.topic);

            if let Some(handler) = self.registry.get_handler(&message.topic) {
                let ctx = HandlerContext::new(correlation_id, Utc::now(), shutdown.clone());
                let started = Instant::now();
                let outcome = AssertUnwindSafe(handler.handle(&ctx, &message))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));
                let elapsed = started.elapsed();

                match outcome {
                    Ok(()) => {
                        report.processed += 1;
                        ConsumerMetrics::record_processed(&message.topic, elapsed);
                        tracing::debug!(
                            duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                            "Message handled"
                        );
                    },
                    Err(e) => {
                        report.failed += 1;
                        ConsumerMetrics::record_failure(&message.topic, elapsed);
                        tracing::warn!(error = %e, "Handler failed");
                        dead_letter(&self.sink, &message, &e.to_string(), report).await;
                    },
                }
            } else {
                report.unroutable += 1;
                ConsumerMetrics::record_unroutable(&message.topic);
                dead_letter(&self.sink, &message, &no_handler_reason(&message.topic), report)
                    .await;
            }

            if let Err(e) = self.consumer.commit(&message).await {
                report.commit_errors += 1;
                ConsumerMetrics::record_commit_error();
                tracing::warn!(error = %e, "Failed to commit offset");
            }
        }
        .instrument(span)
        .await;
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Consumer state changed");
        }
    }
}

/// Handle a poll error. Returns `true` when the loop must stop.
async fn back_off(
    error: BrokerError,
    backoff: Duration,
    shutdown: &mut watch::Receiver<bool>,
    report: &mut ConsumerReport,
) -> bool {
    if error == BrokerError::Closed {
        tracing::info!("Broker session closed");
        return true;
    }

    report.poll_errors += 1;
    ConsumerMetrics::record_poll_error();
    tracing::warn!(
        error = %error,
        transient = error.is_transient(),
        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
        "Poll failed, backing off"
    );

    tokio::select! {
        biased;
        () = shutdown::requested(shutdown) => true,
        () = tokio::time::sleep(backoff) => false,
    }
}

async fn dead_letter(
    sink: &DeadLetterSink,
    message: &BrokerMessage,
    reason: &str,
    report: &mut ConsumerReport,
) {
    let published = sink.report(message, reason).await;
    DeadLetterMetrics::record(&message.topic, published);
    if !published {
        report.dead_letter_failures += 1;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_config_keeps_default_timings() {
        let config = ConsumerConfig::batch(5, Duration::from_secs(3));
        assert_eq!(
            config.mode,
            PollMode::Batch {
                batch_size: 5,
                interval: Duration::from_secs(3),
            }
        );
        assert_eq!(config.poll_timeout, DEFAULT_POLL_TIMEOUT);
        assert_eq!(config.poll_backoff, DEFAULT_POLL_BACKOFF);
    }

    #[test]
    fn batch_config_raises_zero_values() {
        let config = ConsumerConfig::batch(0, Duration::ZERO);
        assert_eq!(
            config.mode,
            PollMode::Batch {
                batch_size: 1,
                interval: MIN_BATCH_INTERVAL,
            }
        );
    }

    #[test]
    fn panic_payloads_become_text() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(&*from_str), "boom");
        assert_eq!(panic_message(&*from_string), "bang");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }

    #[test]
    fn poll_mode_displays_name() {
        assert_eq!(PollMode::Single.to_string(), "single");
        assert_eq!(ConsumerConfig::batch(1, Duration::from_secs(1)).mode.to_string(), "batch");
    }
}
