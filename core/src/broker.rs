//! Broker contract: the message type plus producer and consumer traits.
//!
//! The workflow assumes a partitioned log with consumer groups (Kafka
//! compatible). Delivery is at-least-once: a consumer commits a message only
//! after it was handled or dead-lettered, so a crash in between replays it.
//!
//! # Implementations
//!
//! - `KafkaProducer` / `KafkaConsumer` in `pharmonico-redpanda` (rdkafka)
//! - `InMemoryBroker` in `pharmonico-testing`

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// A message read from (or destined for) the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic the message was published to
    pub topic: String,
    /// Partition key (the prescription id for workflow envelopes)
    pub key: Vec<u8>,
    /// Encoded envelope
    pub value: Vec<u8>,
    /// Partition the message was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl BrokerMessage {
    /// Create a message that has not been assigned a log position yet.
    #[must_use]
    pub fn new(topic: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value: value.into(),
            partition: 0,
            offset: 0,
        }
    }

    /// Set the partition and offset.
    #[must_use]
    pub const fn at(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    /// Key as text (lossy).
    #[must_use]
    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect or create a client
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// `poll` was called before `subscribe`
    #[error("Consumer is not subscribed")]
    NotSubscribed,

    /// Transient transport error while receiving
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failed to commit a consumed offset
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// The client was closed
    #[error("Broker client closed")]
    Closed,
}

impl BrokerError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::PublishFailed { .. }
                | Self::Transport(_)
                | Self::CommitFailed(_)
        )
    }
}

/// Boxed future returned by [`Producer`] methods.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Publishing side of the broker.
///
/// Object safe so one producer can be shared as `Arc<dyn Producer>` between
/// stage handlers, the dead-letter sink, and intake.
pub trait Producer: Send + Sync {
    /// Publish `value` to `topic`, partitioned by `key`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker did not accept the message.
    fn publish<'a>(&'a self, topic: &'a str, key: &'a [u8], value: &'a [u8]) -> BrokerFuture<'a, ()>;

    /// Flush outstanding messages and release the client.
    ///
    /// # Errors
    ///
    /// Returns an error if outstanding messages could not be flushed.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// Consuming side of the broker.
///
/// A consumer is owned by exactly one consumer loop, hence `&mut self`.
pub trait Consumer: Send {
    /// Join the consumer group for `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the subscription is rejected.
    fn subscribe(
        &mut self,
        topics: &[String],
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Wait up to `timeout` for the next message.
    ///
    /// `Ok(None)` means the timeout elapsed without a message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] on receive failures,
    /// [`BrokerError::NotSubscribed`] before `subscribe`, and
    /// [`BrokerError::Closed`] after `close`.
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<BrokerMessage>, BrokerError>> + Send;

    /// Pull up to `max` messages, waiting up to `timeout` for each one.
    ///
    /// Stops early when a pull times out, returning a partial batch. A pull
    /// error after at least one message was collected also ends the batch
    /// early and is logged rather than returned.
    ///
    /// # Errors
    ///
    /// Returns the pull error if it happened before any message was collected.
    fn poll_batch(
        &mut self,
        timeout: Duration,
        max: usize,
    ) -> impl Future<Output = Result<Vec<BrokerMessage>, BrokerError>> + Send {
        async move {
            let mut batch = Vec::with_capacity(max);
            while batch.len() < max {
                match self.poll(timeout).await {
                    Ok(Some(message)) => batch.push(message),
                    Ok(None) => break,
                    Err(e) if batch.is_empty() => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            collected = batch.len(),
                            error = %e,
                            "Pull failed mid-batch, returning partial batch"
                        );
                        break;
                    },
                }
            }
            Ok(batch)
        }
    }

    /// Mark `message` as processed for the consumer group.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CommitFailed`] if the offset was not stored.
    fn commit(
        &mut self,
        message: &BrokerMessage,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Leave the consumer group and release the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session could not be closed cleanly.
    fn close(&mut self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
