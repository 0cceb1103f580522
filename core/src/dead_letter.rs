//! Dead-letter sink for messages that could not be routed or handled.
//!
//! Records are published to [`DEAD_LETTER_QUEUE`] keyed by the original
//! message key, so a prescription's failures land in the same partition as
//! its workflow messages. The sink is write-only: replaying dead letters is an
//! operator task.

use crate::broker::{BrokerError, BrokerMessage, Producer};
use crate::environment::{Clock, SystemClock};
use crate::topics::DEAD_LETTER_QUEUE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Dead-letter reason for a topic without a handler.
#[must_use]
pub fn no_handler_reason(topic: &str) -> String {
    format!("no handler registered for topic '{topic}'")
}

/// What gets published for each dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Id of this record
    pub event_id: String,
    /// Topic the message was read from
    pub original_topic: String,
    /// Original key (lossy UTF-8)
    pub original_key: String,
    /// Original value (lossy UTF-8)
    pub original_value: String,
    /// Handler error text or routing reason
    pub error_reason: String,
    /// When the message was dead-lettered
    pub failed_at: DateTime<Utc>,
    /// Partition the message was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl DeadLetterRecord {
    /// Build the record for `message`.
    #[must_use]
    pub fn from_message(message: &BrokerMessage, reason: &str, failed_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            original_topic: message.topic.clone(),
            original_key: String::from_utf8_lossy(&message.key).into_owned(),
            original_value: String::from_utf8_lossy(&message.value).into_owned(),
            error_reason: reason.to_string(),
            failed_at,
            partition: message.partition,
            offset: message.offset,
        }
    }
}

/// Publishes [`DeadLetterRecord`]s.
#[derive(Clone)]
pub struct DeadLetterSink {
    producer: Arc<dyn Producer>,
    topic: String,
    clock: Arc<dyn Clock>,
}

impl DeadLetterSink {
    /// Sink publishing to `dead_letter_queue`.
    #[must_use]
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self {
            producer,
            topic: DEAD_LETTER_QUEUE.to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Publish to a different topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Override the clock used for `failed_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Topic records are published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a dead-letter record for `message`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the record could not be encoded or published.
    pub async fn publish_dead_letter(
        &self,
        message: &BrokerMessage,
        reason: &str,
    ) -> Result<DeadLetterRecord, BrokerError> {
        let record = DeadLetterRecord::from_message(message, reason, self.clock.now());
        let value = serde_json::to_vec(&record).map_err(|e| BrokerError::PublishFailed {
            topic: self.topic.clone(),
            reason: format!("Failed to encode dead letter: {e}"),
        })?;

        self.producer
            .publish(&self.topic, &message.key, &value)
            .await?;

        tracing::warn!(
            dead_letter_id = %record.event_id,
            original_topic = %record.original_topic,
            partition = record.partition,
            offset = record.offset,
            reason = %reason,
            "Message dead-lettered"
        );
        Ok(record)
    }

    /// Best-effort variant: a failure is logged and reported as `false`.
    pub async fn report(&self, message: &BrokerMessage, reason: &str) -> bool {
        match self.publish_dead_letter(message, reason).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    original_topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    reason = %reason,
                    error = %e,
                    "Failed to publish dead letter"
                );
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_copies_message_position() {
        let message = BrokerMessage::new("payment.completed", "rx_1", br#"{"a":1}"#.to_vec()).at(2, 41);
        let record = DeadLetterRecord::from_message(&message, "boom", DateTime::<Utc>::default());

        assert_eq!(record.original_topic, "payment.completed");
        assert_eq!(record.original_key, "rx_1");
        assert_eq!(record.original_value, r#"{"a":1}"#);
        assert_eq!(record.error_reason, "boom");
        assert_eq!(record.partition, 2);
        assert_eq!(record.offset, 41);
    }

    #[test]
    fn binary_values_are_kept_lossily() {
        let message = BrokerMessage::new("t", "k", vec![0xff, b'x']);
        let record = DeadLetterRecord::from_message(&message, "bad", DateTime::<Utc>::default());
        assert_eq!(record.original_value, "\u{fffd}x");
    }

    #[test]
    fn no_handler_reason_names_topic() {
        assert_eq!(
            no_handler_reason("foo.bar"),
            "no handler registered for topic 'foo.bar'"
        );
    }
}
