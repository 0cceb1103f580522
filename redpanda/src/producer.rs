//! rdkafka-backed [`Producer`].

use pharmonico_core::broker::{BrokerError, BrokerFuture, Producer};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes workflow envelopes to Kafka/Redpanda.
///
/// Cheap to share behind an `Arc`; rdkafka batches sends internally.
///
/// # Example
///
/// ```no_run
/// use pharmonico_redpanda::KafkaProducer;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = KafkaProducer::builder()
///     .brokers("localhost:29092")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct KafkaProducer {
    /// Kafka producer
    producer: FutureProducer,
    /// Delivery timeout per send and for the final flush
    timeout: Duration,
}

impl KafkaProducer {
    /// Create a producer with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> KafkaProducerBuilder {
        KafkaProducerBuilder::default()
    }
}

/// Builder for [`KafkaProducer`].
#[derive(Default)]
pub struct KafkaProducerBuilder {
    brokers: Option<String>,
    client_id: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl KafkaProducerBuilder {
    /// Comma-separated bootstrap servers (e.g., "localhost:29092").
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Client id reported to the broker.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Acknowledgment mode: "0", "1", or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Delivery timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the producer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or the
    /// client configuration is rejected.
    pub fn build(self) -> Result<KafkaProducer, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression);
        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }

        let producer: FutureProducer = config.create().map_err(|e| {
            BrokerError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            acks = acks,
            compression = compression,
            "Kafka producer created"
        );

        Ok(KafkaProducer { producer, timeout })
    }
}

impl Producer for KafkaProducer {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a [u8], value: &'a [u8]) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let record = FutureRecord::to(topic).payload(value).key(key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        "Message published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(BrokerError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let producer = self.producer.clone();
            let timeout = self.timeout;
            // flush blocks the calling thread until queued messages are delivered
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| BrokerError::Transport(format!("Flush task failed: {e}")))?
                .map_err(|e| BrokerError::Transport(format!("Failed to flush producer: {e}")))?;
            tracing::info!("Kafka producer flushed");
            Ok(())
        })
    }
}
