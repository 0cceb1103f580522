//! # Pharmonico Worker
//!
//! Runs every workflow stage in one process against Kafka (or Redpanda),
//! Redis, and `PostgreSQL`. Instances sharing a consumer group split the
//! workflow topics' partitions between them.
//!
//! Configuration comes from environment variables; see [`config`].

pub mod app;
pub mod config;

pub use config::{ConfigError, WorkerConfig};
