//! Kafka-compatible broker backend for Pharmonico.
//!
//! This crate implements the [`Producer`](pharmonico_core::broker::Producer)
//! and [`Consumer`](pharmonico_core::broker::Consumer) contracts from
//! `pharmonico-core` with rdkafka, so the worker runs unchanged against
//! Redpanda, Apache Kafka, or any managed Kafka service.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - `enable.auto.commit` is off; the consumer loop commits each message after
//!   it was handled or dead-lettered
//! - If the process crashes before commit, the message is redelivered
//! - Ordering holds within a partition; workflow envelopes are keyed by
//!   prescription id, so one prescription's events stay ordered
//!
//! # Example
//!
//! ```no_run
//! use pharmonico_core::broker::{Consumer, Producer};
//! use pharmonico_redpanda::{KafkaConsumer, KafkaProducer};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let producer = KafkaProducer::new("localhost:29092")?;
//! producer.publish("intake.received", b"rx_1", b"{}").await?;
//!
//! let mut consumer = KafkaConsumer::builder()
//!     .brokers("localhost:29092")
//!     .group_id("pharmonico-worker")
//!     .build()?;
//! consumer.subscribe(&["intake.received".to_string()]).await?;
//! if let Some(message) = consumer.poll(Duration::from_secs(1)).await? {
//!     consumer.commit(&message).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod consumer;
mod producer;

pub use consumer::{KafkaConsumer, KafkaConsumerBuilder};
pub use producer::{KafkaProducer, KafkaProducerBuilder};
