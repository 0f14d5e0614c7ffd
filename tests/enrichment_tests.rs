/// End-to-end orchestrator tests over the in-memory store and mocked
/// provider APIs.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

use leadflow_api::email_verifier::{EmailVerifier, StaticEmailVerifier};
use leadflow_api::enrichment::EnrichmentOrchestrator;
use leadflow_api::errors::AppError;
use leadflow_api::jobs::JobTracker;
use leadflow_api::models::{
    JobType, Lead, LeadUpdate, Operation, ProviderConfig, ProviderKind, EXISTING_PROVIDER,
    NO_PROVIDER,
};
use leadflow_api::progress::{OperationData, ProgressBus, ProgressEvent};
use leadflow_api::providers::ProviderRegistry;
use leadflow_api::store::{LeadStore, MemoryLeadStore};
use leadflow_api::workflow::{PhoneLookupInput, PhoneLookupWorkflow, WorkflowRunner};

fn lead(id: i64) -> Lead {
    Lead {
        id,
        first_name: "Lead".to_string(),
        last_name: format!("Number{}", id),
        email: format!("lead{}@example.com", id),
        company_name: Some("acme.com".to_string()),
        job_title: Some("Engineer".to_string()),
        phone_number: None,
        email_verified: None,
    }
}

/// Single-provider registry pointed at the mock server's Orion route.
fn orion_registry(server: &MockServer) -> Arc<ProviderRegistry> {
    let config = ProviderConfig {
        name: "Orion Connect".to_string(),
        kind: ProviderKind::OrionConnect,
        endpoint: format!("{}/orionConnect", server.uri()),
        api_key: "mySecretKey123".to_string(),
        priority: 1,
        cost_per_request: 0.02,
        rate_limit: 100,
        time_window: Duration::from_millis(1000),
        max_concurrent: 10,
        enabled: true,
        timeout: Duration::from_secs(5),
    };
    Arc::new(ProviderRegistry::from_configs(vec![config]).expect("registry builds"))
}

struct Harness {
    store: Arc<MemoryLeadStore>,
    runner: Arc<WorkflowRunner>,
    jobs: Arc<JobTracker>,
    bus: Arc<ProgressBus>,
}

impl Harness {
    fn new(
        server: &MockServer,
        leads: Vec<Lead>,
        verifier: Arc<dyn EmailVerifier>,
    ) -> Self {
        let store = Arc::new(MemoryLeadStore::new(leads));
        let workflow = Arc::new(PhoneLookupWorkflow::new(orion_registry(server)));
        let runner = Arc::new(WorkflowRunner::new(workflow, verifier));
        Self {
            store,
            runner,
            jobs: Arc::new(JobTracker::new()),
            bus: Arc::new(ProgressBus::new()),
        }
    }

    fn orchestrator(&self, store: Arc<dyn LeadStore>) -> Arc<EnrichmentOrchestrator> {
        Arc::new(EnrichmentOrchestrator::new(
            store,
            Arc::clone(&self.runner),
            Arc::clone(&self.jobs),
            Arc::clone(&self.bus),
        ))
    }

    /// Runs a batch to completion and returns every event published to its
    /// room, terminal job-complete included.
    async fn run(
        &self,
        store: Arc<dyn LeadStore>,
        leads: Vec<Lead>,
        operations: Vec<Operation>,
    ) -> (String, Vec<ProgressEvent>) {
        let job_id = self
            .jobs
            .create_enrichment_job(leads.len() as u32, operations.clone());
        let mut rx = self.bus.subscribe(&job_id);

        self.orchestrator(store)
            .run_batch(leads, operations, job_id.clone())
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (job_id, events)
    }
}

#[tokio::test]
async fn existing_phone_skips_the_external_call() {
    let server = MockServer::start().await;
    // Any provider traffic at all is a failure.
    Mock::given(path("/orionConnect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "phone": "+1-111" })))
        .expect(0)
        .mount(&server)
        .await;

    let mut seeded = lead(1);
    seeded.phone_number = Some("+1-900".to_string());

    let harness = Harness::new(
        &server,
        vec![seeded.clone()],
        Arc::new(StaticEmailVerifier { verified: true }),
    );
    let (_, events) = harness
        .run(
            Arc::clone(&harness.store) as Arc<dyn LeadStore>,
            vec![seeded],
            vec![Operation::PhoneLookup],
        )
        .await;

    assert_eq!(events.len(), 2);
    match &events[0] {
        ProgressEvent::OperationComplete {
            lead_id,
            operation,
            data: OperationData::Phone {
                phone,
                provider,
                cost,
            },
            progress,
        } => {
            assert_eq!(*lead_id, 1);
            assert_eq!(*operation, Operation::PhoneLookup);
            assert_eq!(phone.as_deref(), Some("+1-900"));
            assert_eq!(provider, EXISTING_PROVIDER);
            assert_eq!(*cost, 0.0);
            assert_eq!(progress.completed, 1);
            assert_eq!(progress.total, 1);
        }
        other => panic!("unexpected first event: {:?}", other),
    }
    assert!(matches!(events[1], ProgressEvent::JobComplete { .. }));
}

#[tokio::test]
async fn known_email_verdict_skips_the_verifier() {
    struct CountingVerifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmailVerifier for CountingVerifier {
        async fn verify(&self, _email: &str) -> Result<bool, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    let server = MockServer::start().await;
    let verifier = Arc::new(CountingVerifier {
        calls: AtomicUsize::new(0),
    });

    let mut seeded = lead(1);
    seeded.email_verified = Some(false);

    let harness = Harness::new(&server, vec![seeded.clone()], verifier.clone());
    let (_, events) = harness
        .run(
            Arc::clone(&harness.store) as Arc<dyn LeadStore>,
            vec![seeded],
            vec![Operation::VerifyEmail],
        )
        .await;

    assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    match &events[0] {
        ProgressEvent::OperationComplete {
            data: OperationData::EmailVerified { email_verified },
            ..
        } => assert!(!email_verified),
        other => panic!("unexpected first event: {:?}", other),
    }
}

#[tokio::test]
async fn full_batch_emits_one_event_per_cell_and_one_terminal_event() {
    let server = MockServer::start().await;
    Mock::given(path("/orionConnect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "phone": "+1-555" })))
        .mount(&server)
        .await;

    let leads: Vec<Lead> = (1..=3).map(lead).collect();
    let harness = Harness::new(
        &server,
        leads.clone(),
        Arc::new(StaticEmailVerifier { verified: true }),
    );
    let operations = vec![Operation::VerifyEmail, Operation::PhoneLookup];
    let (job_id, events) = harness
        .run(
            Arc::clone(&harness.store) as Arc<dyn LeadStore>,
            leads,
            operations,
        )
        .await;

    // 3 leads x 2 operations + terminal event.
    assert_eq!(events.len(), 7);
    let completions = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::OperationComplete { .. }))
        .count();
    assert_eq!(completions, 6);

    match events.last().unwrap() {
        ProgressEvent::JobComplete {
            job_id: terminal_id,
            job_type,
            total_processed,
        } => {
            assert_eq!(terminal_id, &job_id);
            assert_eq!(*job_type, JobType::Enrichment);
            assert_eq!(*total_processed, 3);
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }

    // Results were persisted and the job reached its terminal state.
    for id in 1..=3 {
        let stored = harness.store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.phone_number.as_deref(), Some("+1-555"));
        assert_eq!(stored.email_verified, Some(true));
    }
    assert!(harness.jobs.is_complete(&job_id));
    let job = harness.jobs.get_job(&job_id).unwrap();
    assert_eq!(job.processed_leads, job.total_leads);
    assert_eq!(job.total_leads, 6);
}

#[tokio::test]
async fn failing_persistence_emits_errors_but_job_still_completes() {
    /// Store whose writes always fail; reads delegate to the inner store.
    struct BrokenWrites {
        inner: MemoryLeadStore,
    }

    #[async_trait]
    impl LeadStore for BrokenWrites {
        async fn find_by_id(&self, id: i64) -> Result<Option<Lead>, AppError> {
            self.inner.find_by_id(id).await
        }

        async fn find_many_by_ids(&self, ids: &[i64]) -> Result<Vec<Lead>, AppError> {
            self.inner.find_many_by_ids(ids).await
        }

        async fn update_fields(&self, _id: i64, _update: LeadUpdate) -> Result<(), AppError> {
            Err(AppError::Internal("disk on fire".to_string()))
        }
    }

    let server = MockServer::start().await;
    let leads: Vec<Lead> = (1..=2).map(lead).collect();
    let harness = Harness::new(
        &server,
        leads.clone(),
        Arc::new(StaticEmailVerifier { verified: true }),
    );
    let broken = Arc::new(BrokenWrites {
        inner: MemoryLeadStore::new(leads.clone()),
    });

    let (job_id, events) = harness
        .run(broken, leads, vec![Operation::VerifyEmail])
        .await;

    let errors = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::OperationError { .. }))
        .count();
    assert_eq!(errors, 2);

    // Every failed cell still counted toward progress, so the terminal event
    // fired with nothing processed.
    match events.last().unwrap() {
        ProgressEvent::JobComplete {
            total_processed, ..
        } => assert_eq!(*total_processed, 0),
        other => panic!("unexpected terminal event: {:?}", other),
    }
    assert!(harness.jobs.is_complete(&job_id));
}

#[tokio::test]
async fn lookup_without_result_completes_with_no_provider() {
    let server = MockServer::start().await;
    Mock::given(path("/orionConnect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "phone": null })))
        .expect(1)
        .mount(&server)
        .await;

    let seeded = lead(1);
    let harness = Harness::new(
        &server,
        vec![seeded.clone()],
        Arc::new(StaticEmailVerifier { verified: true }),
    );
    let (_, events) = harness
        .run(
            Arc::clone(&harness.store) as Arc<dyn LeadStore>,
            vec![seeded],
            vec![Operation::PhoneLookup],
        )
        .await;

    match &events[0] {
        ProgressEvent::OperationComplete {
            data: OperationData::Phone {
                phone,
                provider,
                cost,
            },
            ..
        } => {
            assert!(phone.is_none());
            assert_eq!(provider, NO_PROVIDER);
            assert_eq!(*cost, 0.0);
        }
        other => panic!("unexpected first event: {:?}", other),
    }

    // Nothing to persist: the lead still has no phone.
    let stored = harness.store.find_by_id(1).await.unwrap().unwrap();
    assert!(stored.phone_number.is_none());
}

#[tokio::test]
async fn workflow_runner_coalesces_identical_workflow_ids() {
    let server = MockServer::start().await;
    Mock::given(path("/orionConnect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "phone": "+1-555" })))
        .expect(2)
        .mount(&server)
        .await;

    let workflow = Arc::new(PhoneLookupWorkflow::new(orion_registry(&server)));
    let runner = Arc::new(WorkflowRunner::new(
        workflow,
        Arc::new(StaticEmailVerifier { verified: true }),
    ));

    let input = PhoneLookupInput {
        first_name: "Jane".to_string(),
        last_name: "Doe".to_string(),
        company_website: None,
        job_title: None,
    };

    // Same workflow id: one upstream call, shared result.
    let first = runner.phone_lookup("phone-lookup-1-job", input.clone()).await;
    let second = runner.phone_lookup("phone-lookup-1-job", input.clone()).await;
    assert_eq!(first.phone, second.phone);
    assert_eq!(first.timestamp, second.timestamp);

    // A different id is a different workflow and calls upstream again.
    let _third = runner.phone_lookup("phone-lookup-2-job", input).await;
}
