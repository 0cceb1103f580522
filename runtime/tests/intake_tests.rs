//! Intake against the in-memory cache, store, and broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use pharmonico_core::coordination::DedupKey;
use pharmonico_core::payloads::IntakeReceived;
use pharmonico_core::prescription::{Medication, Patient, Prescriber, PrescriptionStatus};
use pharmonico_core::topics::INTAKE_RECEIVED;
use pharmonico_runtime::{
    IntakeConfig, IntakeError, IntakeOutcome, IntakeRequest, IntakeService, RetryPolicy,
};
use pharmonico_testing::{
    InMemoryBroker, InMemoryCache, InMemoryPrescriptionStore, init_test_tracing, test_clock,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    cache: InMemoryCache,
    store: InMemoryPrescriptionStore,
    broker: InMemoryBroker,
    service: IntakeService<InMemoryCache>,
}

fn harness(config: IntakeConfig) -> Harness {
    init_test_tracing();
    let cache = InMemoryCache::new();
    let store = InMemoryPrescriptionStore::new();
    let broker = InMemoryBroker::new();
    let service = IntakeService::new(
        cache.clone(),
        Arc::new(store.clone()),
        Arc::new(broker.producer()),
    )
    .with_config(config)
    .with_op_timeout(Duration::from_millis(500))
    .with_clock(Arc::new(test_clock()));
    Harness {
        cache,
        store,
        broker,
        service,
    }
}

fn request(patient_id: &str) -> IntakeRequest {
    IntakeRequest {
        client_id: "clinic-7".to_string(),
        patient: Patient {
            id: patient_id.to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            date_of_birth: Some("1985-12-10".to_string()),
        },
        prescriber: Prescriber {
            id: "dr-1".to_string(),
            name: "Dr. Hopper".to_string(),
            npi: "1234567893".to_string(),
        },
        medication: Medication {
            ndc: "00002-1234-01".to_string(),
            name: "Amoxicillin".to_string(),
            quantity: 30,
        },
        date_written: "2025-01-01".to_string(),
        ..IntakeRequest::default()
    }
}

fn no_retry() -> RetryPolicy {
    RetryPolicy::fixed(0, Duration::from_millis(10))
}

#[tokio::test(start_paused = true)]
async fn accepted_prescription_is_stored_and_published() {
    let h = harness(IntakeConfig::default());
    let submitted = IntakeRequest {
        correlation_id: Some("c1".to_string()),
        prescription_id: Some("rx_1".to_string()),
        ..request("p1")
    };

    let outcome = h.service.submit(submitted).await.unwrap();
    let IntakeOutcome::Accepted { envelope } = outcome else {
        panic!("expected Accepted, got {outcome:?}");
    };
    assert_eq!(envelope.correlation_id(), "c1");
    assert_eq!(envelope.subject_id(), "rx_1");

    let stored = h.store.snapshot("rx_1").unwrap();
    assert_eq!(stored.status, PrescriptionStatus::Received);
    assert_eq!(stored.created_at, test_clock_now());

    let published = h.broker.envelopes(INTAKE_RECEIVED);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0], envelope);
    assert_eq!(h.broker.published(INTAKE_RECEIVED)[0].key, b"rx_1");

    let payload: IntakeReceived = published[0].payload_as().unwrap();
    assert_eq!(payload.status, PrescriptionStatus::Received);
    assert_eq!(payload.patient.id, "p1");
    assert_eq!(payload.medication.ndc, "00002-1234-01");
    assert_eq!(payload.date_written, "2025-01-01");
}

#[tokio::test(start_paused = true)]
async fn missing_correlation_id_is_generated() {
    let h = harness(IntakeConfig::default());

    let IntakeOutcome::Accepted { envelope } = h.service.submit(request("p1")).await.unwrap() else {
        panic!("expected Accepted");
    };
    assert!(!envelope.correlation_id().is_empty());
    assert!(envelope.subject_id().starts_with("rx_"));
    assert!(envelope.subject_id().ends_with("_p1_00002-1234-01"));
}

#[tokio::test(start_paused = true)]
async fn resubmission_within_window_is_a_duplicate() {
    let h = harness(IntakeConfig::default());

    assert!(matches!(
        h.service.submit(request("p1")).await.unwrap(),
        IntakeOutcome::Accepted { .. }
    ));
    let second = h.service.submit(request("p1")).await.unwrap();
    assert_eq!(
        second,
        IntakeOutcome::Duplicate {
            key: DedupKey::from_parts("p1", "00002-1234-01", "2025-01-01"),
        }
    );
    assert_eq!(h.broker.published(INTAKE_RECEIVED).len(), 1);
    assert_eq!(h.store.save_count(), 1);

    // A different patient is not a duplicate.
    assert!(matches!(
        h.service.submit(request("p2")).await.unwrap(),
        IntakeOutcome::Accepted { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn duplicate_window_expires() {
    let h = harness(IntakeConfig {
        dedup_ttl: Duration::from_secs(60),
        ..IntakeConfig::default()
    });

    h.service.submit(request("p1")).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(matches!(
        h.service.submit(request("p1")).await.unwrap(),
        IntakeOutcome::Accepted { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn client_over_its_limit_is_rate_limited() {
    let h = harness(IntakeConfig {
        rate_limit: 2,
        ..IntakeConfig::default()
    });

    h.service.submit(request("p1")).await.unwrap();
    h.service.submit(request("p2")).await.unwrap();
    let third = h.service.submit(request("p3")).await.unwrap();

    let IntakeOutcome::RateLimited { decision } = third else {
        panic!("expected RateLimited, got {third:?}");
    };
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, 0);
    assert_eq!(
        decision.reset_at,
        test_clock_now() + chrono::Duration::seconds(60)
    );
    assert_eq!(h.broker.published(INTAKE_RECEIVED).len(), 2);
    assert_eq!(h.store.len(), 2);

    // Another client has its own budget.
    let other = IntakeRequest {
        client_id: "clinic-8".to_string(),
        ..request("p3")
    };
    assert!(matches!(
        h.service.submit(other).await.unwrap(),
        IntakeOutcome::Accepted { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn cache_outage_fails_open() {
    let h = harness(IntakeConfig {
        rate_limit: 1,
        ..IntakeConfig::default()
    });
    h.cache.set_unavailable(true);

    for _ in 0..3 {
        assert!(matches!(
            h.service.submit(request("p1")).await.unwrap(),
            IntakeOutcome::Accepted { .. }
        ));
    }
    assert_eq!(h.broker.published(INTAKE_RECEIVED).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_cache_fails_open_after_timeout() {
    let h = harness(IntakeConfig::default());
    h.cache.set_latency(Some(Duration::from_secs(10)));

    let started = tokio::time::Instant::now();
    let outcome = h.service.submit(request("p1")).await.unwrap();

    assert!(matches!(outcome, IntakeOutcome::Accepted { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn publish_failure_releases_the_reservation() {
    let h = harness(IntakeConfig {
        publish_retry: no_retry(),
        ..IntakeConfig::default()
    });
    h.broker.reject_topic(INTAKE_RECEIVED);

    let error = h.service.submit(request("p1")).await.unwrap_err();
    assert!(matches!(error, IntakeError::Publish(_)));
    assert!(h.cache.is_empty());

    // The client can resubmit once the broker recovers.
    let recovered = InMemoryBroker::new();
    let service = IntakeService::new(
        h.cache.clone(),
        Arc::new(h.store.clone()),
        Arc::new(recovered.producer()),
    )
    .with_clock(Arc::new(test_clock()));
    let IntakeOutcome::Accepted { envelope } = service.submit(request("p1")).await.unwrap() else {
        panic!("expected Accepted");
    };
    assert_eq!(recovered.published(INTAKE_RECEIVED).len(), 1);

    // The retry overwrote the document the failed attempt left behind.
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.store.save_count(), 2);
    let stored = h.store.snapshot(envelope.subject_id()).unwrap();
    assert_eq!(stored.status, PrescriptionStatus::Received);
}

#[tokio::test(start_paused = true)]
async fn progressed_prescription_is_not_reset_by_resubmission() {
    let h = harness(IntakeConfig {
        dedup_ttl: Duration::from_secs(60),
        ..IntakeConfig::default()
    });

    let IntakeOutcome::Accepted { envelope } = h.service.submit(request("p1")).await.unwrap() else {
        panic!("expected Accepted");
    };
    let mut stored = h.store.snapshot(envelope.subject_id()).unwrap();
    assert!(stored.advance(PrescriptionStatus::Validated, test_clock_now()));
    h.store.insert(stored);

    // Past the dedup window the same prescription maps to the same id.
    tokio::time::advance(Duration::from_secs(61)).await;
    let outcome = h.service.submit(request("p1")).await.unwrap();
    assert!(matches!(outcome, IntakeOutcome::Duplicate { .. }));

    assert_eq!(h.store.len(), 1);
    assert_eq!(
        h.store.snapshot(envelope.subject_id()).unwrap().status,
        PrescriptionStatus::Validated
    );
    assert_eq!(h.broker.published(INTAKE_RECEIVED).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_publish_failure_is_retried() {
    let h = harness(IntakeConfig {
        publish_retry: RetryPolicy::fixed(3, Duration::from_millis(100)),
        ..IntakeConfig::default()
    });
    h.broker.fail_next_publishes(2);

    let outcome = h.service.submit(request("p1")).await.unwrap();
    assert!(matches!(outcome, IntakeOutcome::Accepted { .. }));
    assert_eq!(h.broker.published(INTAKE_RECEIVED).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn store_failure_releases_the_reservation() {
    let h = harness(IntakeConfig::default());
    h.store.fail_saves(true);

    let error = h.service.submit(request("p1")).await.unwrap_err();
    assert!(matches!(error, IntakeError::Store(_)));
    assert!(h.broker.published(INTAKE_RECEIVED).is_empty());

    h.store.fail_saves(false);
    assert!(matches!(
        h.service.submit(request("p1")).await.unwrap(),
        IntakeOutcome::Accepted { .. }
    ));
}

fn test_clock_now() -> chrono::DateTime<chrono::Utc> {
    use pharmonico_core::environment::Clock;
    test_clock().now()
}
