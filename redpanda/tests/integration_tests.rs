//! Integration tests for [`KafkaProducer`] and [`KafkaConsumer`] against a real Kafka.
//!
//! These tests use testcontainers to start Kafka and validate:
//! - Publish/poll round-trip with key and payload intact
//! - Manual commits: a new group member resumes after the committed offset
//! - Close flushes pending commits before leaving the group
//! - Partial batches when fewer messages than requested are available
//!
//! # Running These Tests
//!
//! Marked `#[ignore]`: they need Docker and take 15-60 seconds each.
//!
//! ```bash
//! cargo test -p pharmonico-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use pharmonico_core::broker::{BrokerMessage, Consumer, Producer};
use pharmonico_redpanda::{KafkaConsumer, KafkaProducer};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

/// Start Kafka and return the container with its bootstrap address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

/// Publish a warmup message until the broker accepts it.
async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(producer) = KafkaProducer::new(brokers) {
            if producer.publish("warmup-topic", b"warmup", b"{}").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

fn consumer(brokers: &str, group: &str) -> KafkaConsumer {
    KafkaConsumer::builder()
        .brokers(brokers)
        .group_id(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create consumer")
}

/// Poll until `count` messages arrived or 30 seconds passed.
async fn poll_n(consumer: &mut KafkaConsumer, count: usize) -> Vec<BrokerMessage> {
    let mut received = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while received.len() < count && tokio::time::Instant::now() < deadline {
        if let Some(message) = consumer
            .poll(Duration::from_secs(1))
            .await
            .expect("Poll failed")
        {
            received.push(message);
        }
    }
    received
}

#[tokio::test]
#[ignore]
async fn publish_and_poll_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = KafkaProducer::new(&brokers).expect("Failed to create producer");
    producer
        .publish("intake.received", b"rx_1", br#"{"correlation_id":"c1","prescription_id":"rx_1"}"#)
        .await
        .expect("Publish failed");

    let mut consumer = consumer(&brokers, "round-trip");
    consumer
        .subscribe(&["intake.received".to_string()])
        .await
        .expect("Subscribe failed");

    let received = poll_n(&mut consumer, 1).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic, "intake.received");
    assert_eq!(received[0].key, b"rx_1");
    assert!(received[0].key_str().starts_with("rx_"));

    consumer.commit(&received[0]).await.expect("Commit failed");
    consumer.close().await.expect("Close failed");
    producer.close().await.expect("Flush failed");
}

#[tokio::test]
#[ignore]
async fn committed_messages_are_not_redelivered_to_the_group() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = KafkaProducer::new(&brokers).expect("Failed to create producer");
    for key in ["rx_1", "rx_2"] {
        producer
            .publish("validation.completed", key.as_bytes(), b"{}")
            .await
            .expect("Publish failed");
    }

    let topics = ["validation.completed".to_string()];
    let mut first = consumer(&brokers, "resume-group");
    first.subscribe(&topics).await.expect("Subscribe failed");
    let received = poll_n(&mut first, 1).await;
    assert_eq!(received.len(), 1);
    first.commit(&received[0]).await.expect("Commit failed");
    // Async commit; give it time to land before leaving the group.
    tokio::time::sleep(Duration::from_secs(1)).await;
    first.close().await.expect("Close failed");

    let mut second = consumer(&brokers, "resume-group");
    second.subscribe(&topics).await.expect("Subscribe failed");
    let resumed = poll_n(&mut second, 1).await;
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].key, b"rx_2");
}

#[tokio::test]
#[ignore]
async fn close_flushes_commits_before_leaving() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = KafkaProducer::new(&brokers).expect("Failed to create producer");
    for key in ["rx_1", "rx_2", "rx_3"] {
        producer
            .publish("routing.completed", key.as_bytes(), b"{}")
            .await
            .expect("Publish failed");
    }

    let topics = ["routing.completed".to_string()];
    let mut first = consumer(&brokers, "flush-group");
    first.subscribe(&topics).await.expect("Subscribe failed");
    let received = poll_n(&mut first, 2).await;
    assert_eq!(received.len(), 2);
    for message in &received {
        first.commit(message).await.expect("Commit failed");
    }
    // No pause: close itself must land the commits.
    first.close().await.expect("Close failed");

    let mut second = consumer(&brokers, "flush-group");
    second.subscribe(&topics).await.expect("Subscribe failed");
    let resumed = poll_n(&mut second, 1).await;
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].key, b"rx_3");
}

#[tokio::test]
#[ignore]
async fn poll_batch_returns_partial_batch() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = KafkaProducer::new(&brokers).expect("Failed to create producer");
    for key in ["rx_1", "rx_2", "rx_3"] {
        producer
            .publish("enrollment.completed", key.as_bytes(), b"{}")
            .await
            .expect("Publish failed");
    }

    let mut consumer = consumer(&brokers, "batch-group");
    consumer
        .subscribe(&["enrollment.completed".to_string()])
        .await
        .expect("Subscribe failed");

    // The first pull waits for the group to be assigned.
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while collected.len() < 3 && tokio::time::Instant::now() < deadline {
        let batch = consumer
            .poll_batch(Duration::from_secs(2), 10)
            .await
            .expect("Batch poll failed");
        assert!(batch.len() <= 10);
        collected.extend(batch);
    }
    assert_eq!(collected.len(), 3);
}

#[tokio::test]
#[ignore]
async fn closed_consumer_reports_closed() {
    let (_kafka, brokers) = start_kafka().await;
    let mut consumer = consumer(&brokers, "closing-group");
    consumer
        .subscribe(&["intake.received".to_string()])
        .await
        .expect("Subscribe failed");
    consumer.close().await.expect("Close failed");

    match consumer.poll(Duration::from_millis(100)).await {
        Err(pharmonico_core::broker::BrokerError::Closed) => {},
        other => panic!("expected Closed, got {other:?}"),
    }
}
