//! Worker lifecycle: connect, reconcile, consume, shut down.

use crate::config::WorkerConfig;
use anyhow::Context;
use pharmonico_core::coordination::CapacityTracker;
use pharmonico_core::dead_letter::DeadLetterSink;
use pharmonico_core::registry::HandlerRegistry;
use pharmonico_core::{Producer, PrescriptionStore};
use pharmonico_postgres::PostgresPrescriptionStore;
use pharmonico_redis::RedisCache;
use pharmonico_redpanda::{KafkaConsumer, KafkaProducer};
use pharmonico_runtime::metrics::MetricsServer;
use pharmonico_runtime::retry::{RetryPolicy, retry_with_backoff};
use pharmonico_runtime::{ShutdownSignal, WorkflowConsumer, shutdown};
use pharmonico_stages::{StageContext, StaticPharmacyDirectory, register_workflow};
use std::sync::Arc;
use std::time::Duration;

/// Retries for the initial connections while dependencies come up.
fn connect_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(5)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(10))
        .build()
}

/// Run the worker until an OS signal arrives or the consumer loop ends.
///
/// # Errors
///
/// Returns an error if a dependency cannot be reached at startup or the
/// consumer fails to subscribe.
pub async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let mut metrics = MetricsServer::new(config.metrics_socket_addr()?);
    metrics.start().context("Failed to start metrics exporter")?;
    tracing::info!(addr = %metrics.addr(), "Metrics exporter listening");

    let policy = connect_policy();

    tracing::info!(url = %config.redis_url, "Connecting to Redis...");
    let cache = retry_with_backoff(&policy, || RedisCache::connect(&config.redis_url))
        .await
        .context("Failed to connect to Redis")?;
    cache.ping().await.context("Redis did not answer PING")?;
    tracing::info!("Redis connected");

    tracing::info!("Connecting to PostgreSQL...");
    let store = retry_with_backoff(&policy, || {
        PostgresPrescriptionStore::connect(&config.database_url)
    })
    .await
    .context("Failed to connect to PostgreSQL")?;
    store.migrate().await.context("Failed to run migrations")?;
    let store = Arc::new(store);
    tracing::info!("PostgreSQL connected, migrations applied");

    tracing::info!(brokers = %config.kafka.brokers, "Connecting to Kafka...");
    let producer: Arc<dyn Producer> = Arc::new(
        KafkaProducer::builder()
            .brokers(config.kafka.brokers.clone())
            .client_id(format!("{}-producer", config.kafka.consumer_group))
            .build()
            .context("Failed to create Kafka producer")?,
    );
    let consumer = KafkaConsumer::builder()
        .brokers(config.kafka.brokers.clone())
        .group_id(config.kafka.consumer_group.clone())
        .client_id(config.kafka.client_id.clone())
        .auto_offset_reset(config.kafka.auto_offset_reset.clone())
        .build()
        .context("Failed to create Kafka consumer")?;
    tracing::info!(group_id = %consumer.group_id(), "Kafka clients created");

    let capacity = CapacityTracker::new(cache)
        .with_ttl(config.capacity_ttl())
        .with_default_max(config.coordination.capacity_default_max)
        .with_op_timeout(config.cache_op_timeout());
    reconcile_capacity(&capacity, &store, &config).await;

    let ctx = StageContext::new(
        Arc::clone(&store) as Arc<dyn PrescriptionStore>,
        Arc::clone(&producer),
    );
    let registry = HandlerRegistry::new();
    register_workflow(
        &registry,
        &ctx,
        &capacity,
        Arc::new(StaticPharmacyDirectory::new(config.pharmacies.clone())),
        &config.stage_config(),
    )
    .context("Failed to register workflow stages")?;

    let signal = ShutdownSignal::new();
    let mut worker = WorkflowConsumer::new(
        consumer,
        Arc::new(registry),
        DeadLetterSink::new(Arc::clone(&producer)),
        config.consumer_config(),
    );
    let receiver = signal.subscribe();
    let mut handle = tokio::spawn(async move { worker.run(receiver).await });

    tracing::info!("Worker running, press Ctrl+C to stop");

    let finished = tokio::select! {
        result = shutdown::wait_for_os_signal() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            None
        }
        joined = &mut handle => Some(joined),
    };

    let joined = match finished {
        Some(joined) => Some(joined),
        None => {
            signal.trigger();
            match tokio::time::timeout(config.shutdown_timeout(), &mut handle).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = config.shutdown_timeout_secs,
                        "Consumer loop did not drain in time, abandoning it"
                    );
                    handle.abort();
                    None
                },
            }
        },
    };

    if let Err(e) = producer.close().await {
        tracing::warn!(error = %e, "Failed to flush producer");
    }

    if let Some(joined) = joined {
        let report = joined
            .context("Consumer task panicked")?
            .context("Consumer loop failed")?;
        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            unroutable = report.unroutable,
            "Worker stopped"
        );
    }
    Ok(())
}

/// Rebuild capacity records from prescriptions still in flight.
///
/// A failure leaves the cache as it was; routing seeds missing records
/// from the directory on demand.
async fn reconcile_capacity(
    capacity: &CapacityTracker<RedisCache>,
    store: &PostgresPrescriptionStore,
    config: &WorkerConfig,
) {
    let counts = match store.count_in_flight_by_pharmacy().await {
        Ok(counts) => counts,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to count in-flight prescriptions, skipping reconcile");
            return;
        },
    };

    let snapshots = config
        .pharmacies
        .iter()
        .map(|pharmacy| pharmacy.snapshot(counts.get(&pharmacy.id).copied().unwrap_or(0)));
    if let Err(e) = capacity.reconcile(snapshots).await {
        tracing::warn!(error = %e, "Failed to reconcile capacity cache");
    }
}
