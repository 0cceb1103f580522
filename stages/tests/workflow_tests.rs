//! End-to-end runs: intake, then every stage driven by the consumer loop.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use pharmonico_core::coordination::CapacityTracker;
use pharmonico_core::dead_letter::{DeadLetterRecord, DeadLetterSink};
use pharmonico_core::envelope::Envelope;
use pharmonico_core::payloads::{PaymentCompleted, PaymentLinkCreated, ShipmentDelivered};
use pharmonico_core::prescription::{Medication, Patient, Prescriber, PrescriptionStatus};
use pharmonico_core::registry::HandlerRegistry;
use pharmonico_core::topics;
use pharmonico_runtime::{
    ConsumerConfig, ConsumerReport, IntakeOutcome, IntakeRequest, IntakeService, ShutdownSignal,
    WorkflowConsumer,
};
use pharmonico_stages::{
    AdjudicationPolicy, Pharmacy, StageConfig, StageContext, StaticPharmacyDirectory,
    register_workflow,
};
use pharmonico_testing::{
    InMemoryBroker, InMemoryCache, InMemoryPrescriptionStore, init_test_tracing, test_clock,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(30);

struct Workflow {
    broker: InMemoryBroker,
    store: InMemoryPrescriptionStore,
    capacity: CapacityTracker<InMemoryCache>,
    intake: IntakeService<InMemoryCache>,
    signal: ShutdownSignal,
    handle: JoinHandle<ConsumerReport>,
}

impl Workflow {
    fn start(config: StageConfig) -> Self {
        init_test_tracing();
        let broker = InMemoryBroker::new();
        let store = InMemoryPrescriptionStore::new();
        let cache = InMemoryCache::new();
        let clock = Arc::new(test_clock());

        let capacity = CapacityTracker::new(cache.clone()).with_clock(clock.clone());
        let ctx = StageContext::new(Arc::new(store.clone()), Arc::new(broker.producer()))
            .with_clock(clock.clone());
        let directory = StaticPharmacyDirectory::new(vec![Pharmacy::new("ph-1", "1234567", 40)]);
        let registry = HandlerRegistry::new();
        register_workflow(&registry, &ctx, &capacity, Arc::new(directory), &config).unwrap();

        let intake = IntakeService::new(
            cache,
            Arc::new(store.clone()),
            Arc::new(broker.producer()),
        )
        .with_clock(clock);

        let signal = ShutdownSignal::new();
        let sink = DeadLetterSink::new(Arc::new(broker.producer()));
        let mut consumer = WorkflowConsumer::new(
            broker.consumer(),
            Arc::new(registry),
            sink,
            ConsumerConfig::single(),
        );
        let shutdown = signal.subscribe();
        let handle = tokio::spawn(async move { consumer.run(shutdown).await.unwrap() });

        Self {
            broker,
            store,
            capacity,
            intake,
            signal,
            handle,
        }
    }

    async fn submit(&self, prescriber_id: &str) -> Envelope {
        let request = IntakeRequest {
            client_id: "clinic-7".to_string(),
            correlation_id: Some("c1".to_string()),
            prescription_id: Some("rx_1".to_string()),
            patient: Patient {
                id: "p1".to_string(),
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                date_of_birth: None,
            },
            prescriber: Prescriber {
                id: prescriber_id.to_string(),
                name: "Dr. Hopper".to_string(),
                npi: "1234567893".to_string(),
            },
            medication: Medication {
                ndc: "00002-1234-01".to_string(),
                name: "Amoxicillin".to_string(),
                quantity: 30,
            },
            date_written: "2025-01-01".to_string(),
        };
        match self.intake.submit(request).await.unwrap() {
            IntakeOutcome::Accepted { envelope } => envelope,
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    /// Wait until `rx_1` reaches `status`.
    async fn reaches(&self, status: PrescriptionStatus) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.store.snapshot("rx_1").is_some_and(|rx| rx.status == status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn capacity_count(&self) -> u32 {
        self.capacity
            .get("ph-1")
            .await
            .unwrap()
            .map_or(0, |record| record.current_count)
    }

    fn inject<T: serde::Serialize>(&self, topic: &str, payload: &T) {
        let envelope = Envelope::from_typed("c1", "rx_1", payload, test_clock_now()).unwrap();
        self.broker.inject(topic, b"rx_1", &envelope.to_bytes().unwrap());
    }

    async fn stop(self) -> ConsumerReport {
        self.signal.trigger();
        self.handle.await.unwrap()
    }
}

fn test_clock_now() -> chrono::DateTime<chrono::Utc> {
    use pharmonico_core::environment::Clock;
    test_clock().now()
}

fn waived() -> StageConfig {
    StageConfig {
        adjudication: AdjudicationPolicy {
            copay_amount: 0.0,
            insurance_pays: 200.0,
        },
        ..StageConfig::default()
    }
}

#[test]
fn every_workflow_topic_but_the_payment_link_has_a_stage() {
    let registry = HandlerRegistry::new();
    let ctx = StageContext::new(
        Arc::new(InMemoryPrescriptionStore::new()),
        Arc::new(InMemoryBroker::new().producer()),
    );
    register_workflow(
        &registry,
        &ctx,
        &CapacityTracker::new(InMemoryCache::new()),
        Arc::new(StaticPharmacyDirectory::default()),
        &StageConfig::default(),
    )
    .unwrap();

    let expected: BTreeSet<String> = topics::WORKFLOW
        .iter()
        .filter(|topic| **topic != topics::PAYMENT_LINK_CREATED)
        .map(ToString::to_string)
        .collect();
    assert_eq!(registry.list_topics(), expected);
}

#[tokio::test(start_paused = true)]
async fn waived_copay_runs_from_intake_to_delivered() {
    let workflow = Workflow::start(waived());

    let accepted = workflow.submit("dr-1").await;
    assert_eq!(accepted.correlation_id(), "c1");

    assert!(workflow.reaches(PrescriptionStatus::InTransit).await);
    assert_eq!(workflow.capacity_count().await, 1);

    // Every hop carried the intake's correlation and subject.
    for topic in [
        topics::INTAKE_RECEIVED,
        topics::VALIDATION_COMPLETED,
        topics::ENROLLMENT_COMPLETED,
        topics::PHARMACY_SELECTED,
        topics::ADJUDICATION_COMPLETED,
        topics::PAYMENT_COMPLETED,
        topics::SHIPMENT_LABEL_CREATED,
    ] {
        let envelopes = workflow.broker.envelopes(topic);
        assert_eq!(envelopes.len(), 1, "{topic}");
        assert_eq!(envelopes[0].correlation_id(), "c1", "{topic}");
        assert_eq!(envelopes[0].subject_id(), "rx_1", "{topic}");
    }
    assert!(workflow.broker.published(topics::PAYMENT_LINK_CREATED).is_empty());

    workflow.inject(
        topics::SHIPMENT_DELIVERED,
        &ShipmentDelivered {
            tracking_number: "TRK0123456789AB".to_string(),
            delivered_at: test_clock_now(),
        },
    );
    assert!(workflow.reaches(PrescriptionStatus::Delivered).await);
    assert_eq!(workflow.capacity_count().await, 0);

    let stored = workflow.store.snapshot("rx_1").unwrap();
    assert_eq!(stored.pharmacy_id.as_deref(), Some("ph-1"));
    for stage in ["validation", "enrollment", "routing", "adjudication", "payment", "shipment", "delivery"] {
        assert!(stored.details.contains_key(stage), "{stage}");
    }

    let report = workflow.stop().await;
    assert_eq!(report.processed, 8);
    assert_eq!(report.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn copay_waits_for_payment_before_shipping() {
    let workflow = Workflow::start(StageConfig::default());
    workflow.submit("dr-1").await;

    assert!(
        workflow
            .broker
            .wait_for(topics::PAYMENT_LINK_CREATED, 1, WAIT)
            .await
    );
    assert!(workflow.reaches(PrescriptionStatus::AwaitingPayment).await);
    assert!(workflow.broker.published(topics::SHIPMENT_LABEL_CREATED).is_empty());

    let link: PaymentLinkCreated = workflow.broker.envelopes(topics::PAYMENT_LINK_CREATED)[0]
        .payload_as()
        .unwrap();
    assert!(link.payment_link_url.starts_with("https://pay.pharmonico.com/"));

    workflow.inject(
        topics::PAYMENT_COMPLETED,
        &PaymentCompleted {
            patient_id: "p1".to_string(),
            amount: link.amount,
            status: "paid".to_string(),
            completed_at: test_clock_now(),
        },
    );
    assert!(workflow.reaches(PrescriptionStatus::InTransit).await);

    workflow.stop().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_prescription_goes_no_further() {
    let workflow = Workflow::start(StageConfig::default());
    workflow.submit("").await;

    assert!(workflow.reaches(PrescriptionStatus::ValidationFailed).await);
    assert!(workflow.broker.published(topics::VALIDATION_COMPLETED).is_empty());
    assert_eq!(
        workflow.store.snapshot("rx_1").unwrap().validation_errors,
        vec!["prescriber_id is required"]
    );

    let report = workflow.stop().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_prescription_is_dead_lettered() {
    let workflow = Workflow::start(StageConfig::default());

    workflow.inject(
        topics::SHIPMENT_DELIVERED,
        &ShipmentDelivered {
            tracking_number: "TRK0123456789AB".to_string(),
            delivered_at: test_clock_now(),
        },
    );
    assert!(
        workflow
            .broker
            .wait_for(topics::DEAD_LETTER_QUEUE, 1, WAIT)
            .await
    );

    let record: DeadLetterRecord =
        serde_json::from_slice(&workflow.broker.published(topics::DEAD_LETTER_QUEUE)[0].value)
            .unwrap();
    assert_eq!(record.original_topic, topics::SHIPMENT_DELIVERED);
    assert!(record.error_reason.contains("not found"), "{}", record.error_reason);

    let report = workflow.stop().await;
    assert_eq!(report.failed, 1);
}
