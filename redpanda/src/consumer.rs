//! rdkafka-backed [`Consumer`].

use pharmonico_core::broker::{BrokerError, BrokerMessage, Consumer};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::time::Duration;

/// Consumer-group member for the workflow topics.
///
/// Offsets are committed explicitly through [`Consumer::commit`]; the stored
/// offset is the message offset plus one, so a restart resumes after the last
/// committed message. Commits are asynchronous; [`Consumer::close`] commits
/// the latest offset per partition synchronously before leaving the group.
pub struct KafkaConsumer {
    /// rdkafka consumer; `None` once closed
    consumer: Option<StreamConsumer>,
    /// Consumer group, for logging
    group_id: String,
    /// Whether `subscribe` succeeded
    subscribed: bool,
    /// Highest offset committed per (topic, partition)
    committed: BTreeMap<(String, i32), i64>,
}

impl KafkaConsumer {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> KafkaConsumerBuilder {
        KafkaConsumerBuilder::default()
    }

    /// Consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn final_offsets(&self) -> Result<TopicPartitionList, BrokerError> {
        let mut offsets = TopicPartitionList::new();
        for ((topic, partition), offset) in &self.committed {
            offsets
                .add_partition_offset(topic, *partition, Offset::Offset(*offset))
                .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;
        }
        Ok(offsets)
    }

    fn active(&self) -> Result<&StreamConsumer, BrokerError> {
        let consumer = self.consumer.as_ref().ok_or(BrokerError::Closed)?;
        if self.subscribed {
            Ok(consumer)
        } else {
            Err(BrokerError::NotSubscribed)
        }
    }
}

/// Builder for [`KafkaConsumer`].
#[derive(Default)]
pub struct KafkaConsumerBuilder {
    brokers: Option<String>,
    group_id: Option<String>,
    client_id: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl KafkaConsumerBuilder {
    /// Comma-separated bootstrap servers (e.g., "localhost:29092").
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Consumer group. Workers sharing a group split the partitions.
    ///
    /// Default: "pharmonico-worker"
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Client id reported to the broker.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Where a new group starts reading: "earliest" or "latest".
    ///
    /// Default: "latest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Group session timeout.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the consumer. No connection is made until `subscribe`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or the
    /// client configuration is rejected.
    pub fn build(self) -> Result<KafkaConsumer, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let group_id = self
            .group_id
            .unwrap_or_else(|| "pharmonico-worker".to_string());
        let auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest");
        let session_timeout = self.session_timeout.unwrap_or(Duration::from_secs(10));

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", auto_offset_reset)
            .set("session.timeout.ms", session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false");
        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }

        let consumer: StreamConsumer = config.create().map_err(|e| {
            BrokerError::ConnectionFailed(format!("Failed to create consumer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            consumer_group = %group_id,
            auto_offset_reset = auto_offset_reset,
            manual_commit = true,
            "Kafka consumer created"
        );

        Ok(KafkaConsumer {
            consumer: Some(consumer),
            group_id,
            subscribed: false,
            committed: BTreeMap::new(),
        })
    }
}

impl Consumer for KafkaConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        let consumer = self.consumer.as_ref().ok_or(BrokerError::Closed)?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::SubscriptionFailed {
                topics: topics.to_vec(),
                reason: e.to_string(),
            })?;

        self.subscribed = true;
        tracing::info!(
            topics = ?topics,
            consumer_group = %self.group_id,
            "Subscribed to topics"
        );
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        let consumer = self.active()?;

        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(e)) => Err(BrokerError::Transport(format!("Failed to receive message: {e}"))),
            Ok(Ok(message)) => {
                let received = BrokerMessage::new(
                    message.topic(),
                    message.key().unwrap_or_default(),
                    message.payload().unwrap_or_default(),
                )
                .at(message.partition(), message.offset());
                tracing::trace!(
                    topic = %received.topic,
                    partition = received.partition,
                    offset = received.offset,
                    "Received message"
                );
                Ok(Some(received))
            },
        }
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let consumer = self.active()?;

        let next = message.offset + 1;
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&message.topic, message.partition, Offset::Offset(next))
            .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;
        consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;

        let entry = self
            .committed
            .entry((message.topic.clone(), message.partition))
            .or_insert(next);
        *entry = (*entry).max(next);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let offsets = self.final_offsets();
        if let Some(consumer) = self.consumer.take() {
            if self.subscribed && !self.committed.is_empty() {
                let flushed = offsets.and_then(|offsets| {
                    consumer
                        .commit(&offsets, CommitMode::Sync)
                        .map_err(|e| BrokerError::CommitFailed(e.to_string()))
                });
                match flushed {
                    Ok(()) => tracing::debug!(
                        partitions = self.committed.len(),
                        "Final offsets committed"
                    ),
                    Err(e) => tracing::warn!(
                        consumer_group = %self.group_id,
                        error = %e,
                        "Failed to commit final offsets"
                    ),
                }
            }
            self.committed.clear();
            if self.subscribed {
                consumer.unsubscribe();
            }
            self.subscribed = false;
            // Dropping the consumer leaves the group.
            drop(consumer);
            tracing::info!(consumer_group = %self.group_id, "Kafka consumer closed");
        }
        Ok(())
    }
}
