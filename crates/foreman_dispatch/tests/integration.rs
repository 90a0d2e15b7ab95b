//! End-to-end dispatch scenarios against a scripted worker transport.

use foreman_dispatch::{DispatchConfig, InFlightTracker, JobManager};
use foreman_envelope::{EnvelopeDraft, EnvelopeSigner, EnvelopeVerifier};
use foreman_protocol::wire::{CallbackPayload, CallbackStatus};
use foreman_protocol::{
    DispatchError, ErrorKind, JobId, JobState, OrchestratorError, Payload, Request, RequestId,
    RequestState, ResultKind, WorkerDescriptor,
};
use foreman_registry::{Registry, RegistryConfig};
use foreman_router::{Router, RouterConfig};
use foreman_state::{MemoryStateStore, StateStore};
use foreman_store::{MemoryBlobBackend, ResultStore, StoreConfig};
use foreman_test_utils::{cap, keys, request, worker, MockTransport};
use foreman_transport::DispatchOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const TTL: Duration = Duration::from_secs(900);
const SKEW: Duration = Duration::from_secs(60);

struct Harness {
    manager: Arc<JobManager>,
    transport: Arc<MockTransport>,
    results: Arc<ResultStore>,
    state: Arc<MemoryStateStore>,
    signer: Arc<EnvelopeSigner>,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn start(workers: Vec<WorkerDescriptor>) -> Self {
        let transport = Arc::new(MockTransport::new());
        let registry = Arc::new(Registry::new(
            transport.clone(),
            RegistryConfig::default(),
        ));
        for w in workers {
            registry.register(w);
        }
        registry.probe_all().await;

        let state = Arc::new(MemoryStateStore::new());
        let results = Arc::new(ResultStore::new(
            state.clone(),
            Arc::new(MemoryBlobBackend::new()),
            StoreConfig::default(),
        ));
        let in_flight = Arc::new(InFlightTracker::new());
        let router = Arc::new(Router::new(
            registry.clone(),
            in_flight.clone(),
            RouterConfig::default(),
        ));
        let signer = Arc::new(
            EnvelopeSigner::from_pem(keys::TEST_RSA_PRIVATE.as_bytes(), "foreman", TTL).unwrap(),
        );
        let verifier = Arc::new(
            EnvelopeVerifier::from_pems(&[keys::TEST_RSA_PUBLIC.as_bytes()], TTL, SKEW).unwrap(),
        );

        let config = DispatchConfig {
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(100),
            ..DispatchConfig::default()
        };
        let manager = Arc::new(JobManager::new(
            registry.clone(),
            router,
            signer.clone(),
            verifier,
            transport.clone(),
            results.clone(),
            state.clone(),
            in_flight,
            config,
        ));

        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(manager.clone().run_dispatcher(rx));

        Self {
            manager,
            transport,
            results,
            state,
            signer,
            shutdown,
        }
    }

    async fn wait_for_state(&self, id: &RequestId, state: RequestState, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.manager.status(id) {
                if status.state == state {
                    return;
                }
                assert!(
                    !(status.state.is_terminal() && status.state != state),
                    "request reached terminal {:?} while waiting for {:?}: {:?}",
                    status.state,
                    state,
                    status.error
                );
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {state:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn latest_job_id(&self, id: &RequestId) -> JobId {
        let jobs = self.state.jobs_for_request(id).await.unwrap();
        jobs.last().expect("request has a job").id.clone()
    }

    fn signed_callback(
        &self,
        task_id: &JobId,
        status: CallbackStatus,
        results: Option<Payload>,
        error: Option<String>,
    ) -> CallbackPayload {
        let token = self
            .signer
            .sign(EnvelopeDraft {
                task_id: task_id.clone(),
                owner: "worker".to_string(),
                payload_digest: String::new(),
                repo_url: None,
                content_ref: None,
                callback_url: String::new(),
                consent_given: false,
            })
            .unwrap();
        CallbackPayload {
            task_id: task_id.clone(),
            status,
            results,
            error,
            envelope_jwt: Some(token),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn analysis_worker() -> WorkerDescriptor {
    worker("w1")
        .kind("code_analysis")
        .capability(cap("code_analysis", "1.0.0", &["read"]))
        .build()
}

fn analysis_request() -> Request {
    request("alice", "code_analysis")
        .with_capabilities(vec![cap("code_analysis", "1.0.0", &["read"])])
}

#[tokio::test]
async fn test_happy_path_inline_result() {
    let harness = Harness::start(vec![analysis_worker()]).await;
    harness.transport.enqueue_dispatch(
        &"w1".into(),
        Ok(DispatchOutcome::Direct {
            bytes: b"analysis-report".to_vec(),
            content_type: "text/plain".to_string(),
        }),
    );

    let status = harness.manager.submit(analysis_request()).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Succeeded, Duration::from_secs(5))
        .await;

    let final_status = harness.manager.status(&status.id).unwrap();
    assert_eq!(final_status.attempts_made, 1);
    assert_eq!(final_status.last_worker_id.unwrap().as_str(), "w1");
    assert!(final_status.error.is_none());

    let result = harness
        .results
        .get("alice", &final_status.result_id.unwrap())
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Inline);
    assert_eq!(
        harness.results.resolve_bytes(&result).await.unwrap(),
        b"analysis-report"
    );

    // The dispatched envelope binds the payload and verifies.
    let dispatched = harness.transport.dispatches();
    assert_eq!(dispatched.len(), 1);
    let claims =
        foreman_test_utils::decode_claims_unverified(&dispatched[0].request.envelope_jwt);
    assert_eq!(claims["owner"], "alice");
    assert_eq!(
        claims["payload_digest"].as_str().unwrap(),
        dispatched[0].request.payload.digest()
    );

    let metrics = harness.manager.metrics();
    assert_eq!(metrics.jobs_succeeded, 1);
    assert_eq!(metrics.jobs_dispatched, 1);
}

#[tokio::test]
async fn test_capability_version_mismatch_fails_fast() {
    let stale = worker("w-old")
        .kind("code_analysis")
        .capability(cap("code_analysis", "0.9.0", &["read"]))
        .build();
    let harness = Harness::start(vec![stale]).await;

    let req = analysis_request();
    let id = req.id.clone();
    let err = harness.manager.submit(req).await.unwrap_err();
    assert_eq!(err, OrchestratorError::NoWorkerAvailable);

    let status = harness.manager.status(&id).unwrap();
    assert_eq!(status.state, RequestState::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::NoWorkerAvailable);
    assert_eq!(harness.transport.dispatch_count(), 0);
}

#[tokio::test]
async fn test_retry_after_503_then_success() {
    let harness = Harness::start(vec![analysis_worker()]).await;
    harness
        .transport
        .enqueue_dispatch(&"w1".into(), Err(DispatchError::Http5xx(503)));
    harness.transport.enqueue_dispatch(
        &"w1".into(),
        Ok(DispatchOutcome::Direct {
            bytes: b"second time lucky".to_vec(),
            content_type: "text/plain".to_string(),
        }),
    );

    let status = harness.manager.submit(analysis_request()).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Succeeded, Duration::from_secs(5))
        .await;

    let final_status = harness.manager.status(&status.id).unwrap();
    assert_eq!(final_status.attempts_made, 2);

    let jobs = harness.state.jobs_for_request(&status.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert_eq!(jobs[1].state, JobState::Succeeded);

    let metrics = harness.manager.metrics();
    assert_eq!(metrics.jobs_retried, 1);
    assert_eq!(metrics.jobs_succeeded, 1);
}

#[tokio::test]
async fn test_async_worker_that_never_calls_back_times_out() {
    let harness = Harness::start(vec![analysis_worker()]).await;
    harness.transport.enqueue_async_ack(&"w1".into());
    harness.transport.enqueue_async_ack(&"w1".into());

    let req = analysis_request()
        .with_deadline(Duration::from_secs(1))
        .with_max_attempts(2);
    let status = harness.manager.submit(req).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Failed, Duration::from_secs(8))
        .await;

    let final_status = harness.manager.status(&status.id).unwrap();
    assert_eq!(final_status.attempts_made, 2);
    let failure = final_status.error.unwrap();
    assert_eq!(failure.kind, ErrorKind::JobTimeout);

    let metrics = harness.manager.metrics();
    assert_eq!(metrics.jobs_timed_out, 2);
    assert_eq!(metrics.jobs_failed, 1);
}

#[tokio::test]
async fn test_cancellation_mid_run_discards_late_callback() {
    let harness = Harness::start(vec![analysis_worker()]).await;
    harness.transport.enqueue_async_ack(&"w1".into());

    let status = harness.manager.submit(analysis_request()).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Running, Duration::from_secs(5))
        .await;

    assert!(harness.manager.cancel(&status.id).await);
    // Idempotent.
    assert!(harness.manager.cancel(&status.id).await);

    harness
        .wait_for_state(&status.id, RequestState::Cancelled, Duration::from_secs(5))
        .await;
    let job_id = harness.latest_job_id(&status.id).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let jobs = harness.state.jobs_for_request(&status.id).await.unwrap();
        if jobs.last().unwrap().state == JobState::Cancelled {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never cancelled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A late worker callback for the same task is ignored outright.
    let callback = harness.signed_callback(
        &job_id,
        CallbackStatus::Completed,
        Some(Payload::new(b"too late".to_vec(), "text/plain")),
        None,
    );
    harness.manager.handle_callback(callback).await.unwrap();

    let final_status = harness.manager.status(&status.id).unwrap();
    assert_eq!(final_status.state, RequestState::Cancelled);
    assert!(final_status.result_id.is_none());
    let (results, _) = harness
        .results
        .list_by_owner("alice", None, 10)
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_pointer_artifact_for_pointer_preferring_worker() {
    let pointer_worker = worker("w1")
        .kind("code_analysis")
        .capability(cap("code_analysis", "1.0.0", &["read"]))
        .prefers_pointer()
        .build();
    let harness = Harness::start(vec![pointer_worker]).await;
    let megabyte = vec![0x42u8; 1024 * 1024];
    harness.transport.enqueue_dispatch(
        &"w1".into(),
        Ok(DispatchOutcome::Direct {
            bytes: megabyte.clone(),
            content_type: "application/octet-stream".to_string(),
        }),
    );

    let status = harness.manager.submit(analysis_request()).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Succeeded, Duration::from_secs(5))
        .await;

    let final_status = harness.manager.status(&status.id).unwrap();
    let result = harness
        .results
        .get("alice", &final_status.result_id.unwrap())
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Pointer);
    assert_eq!(result.size, 1_048_576);
    assert_eq!(result.checksum, foreman_protocol::sha256_hex(&megabyte));
    assert_eq!(
        harness.results.resolve_bytes(&result).await.unwrap(),
        megabyte
    );
}

#[tokio::test]
async fn test_async_callback_completes_job_and_duplicate_is_ignored() {
    let harness = Harness::start(vec![analysis_worker()]).await;
    harness.transport.enqueue_async_ack(&"w1".into());

    let status = harness.manager.submit(analysis_request()).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Running, Duration::from_secs(5))
        .await;

    let job_id = harness.latest_job_id(&status.id).await;
    let callback = harness.signed_callback(
        &job_id,
        CallbackStatus::Completed,
        Some(Payload::new(b"async artifact".to_vec(), "text/plain")),
        None,
    );
    harness.manager.handle_callback(callback.clone()).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Succeeded, Duration::from_secs(5))
        .await;

    // Second delivery of the same callback: ignored, no duplicate result.
    harness.manager.handle_callback(callback).await.unwrap();
    let (results, _) = harness
        .results
        .list_by_owner("alice", None, 10)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        harness.results.resolve_bytes(&results[0]).await.unwrap(),
        b"async artifact"
    );
}

#[tokio::test]
async fn test_unsigned_and_badly_signed_callbacks_are_rejected() {
    let harness = Harness::start(vec![analysis_worker()]).await;
    harness.transport.enqueue_async_ack(&"w1".into());

    let status = harness.manager.submit(analysis_request()).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Running, Duration::from_secs(5))
        .await;
    let job_id = harness.latest_job_id(&status.id).await;

    // Unsigned.
    let mut unsigned = harness.signed_callback(&job_id, CallbackStatus::Completed, None, None);
    unsigned.envelope_jwt = None;
    assert!(matches!(
        harness.manager.handle_callback(unsigned).await,
        Err(OrchestratorError::EnvelopeInvalid(_))
    ));

    // Signed by the wrong key.
    let foreign_signer =
        EnvelopeSigner::from_pem(keys::ALT_RSA_PRIVATE.as_bytes(), "foreman", TTL).unwrap();
    let forged_token = foreign_signer
        .sign(EnvelopeDraft {
            task_id: job_id.clone(),
            owner: "mallory".to_string(),
            payload_digest: String::new(),
            repo_url: None,
            content_ref: None,
            callback_url: String::new(),
            consent_given: false,
        })
        .unwrap();
    let forged = CallbackPayload {
        task_id: job_id.clone(),
        status: CallbackStatus::Completed,
        results: Some(Payload::new(b"forged".to_vec(), "text/plain")),
        error: None,
        envelope_jwt: Some(forged_token),
    };
    assert!(matches!(
        harness.manager.handle_callback(forged).await,
        Err(OrchestratorError::EnvelopeInvalid(_))
    ));

    // The job is still running and a genuine callback still lands.
    let genuine = harness.signed_callback(
        &job_id,
        CallbackStatus::Completed,
        Some(Payload::new(b"real".to_vec(), "text/plain")),
        None,
    );
    harness.manager.handle_callback(genuine).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Succeeded, Duration::from_secs(5))
        .await;

    let metrics = harness.manager.metrics();
    assert_eq!(metrics.callbacks_rejected, 2);
    assert_eq!(metrics.callbacks_accepted, 1);
}

#[tokio::test]
async fn test_worker_reported_try_again_is_retried() {
    let harness = Harness::start(vec![analysis_worker()]).await;
    harness.transport.enqueue_async_ack(&"w1".into());
    harness.transport.enqueue_dispatch(
        &"w1".into(),
        Ok(DispatchOutcome::Direct {
            bytes: b"recovered".to_vec(),
            content_type: "text/plain".to_string(),
        }),
    );

    let status = harness.manager.submit(analysis_request()).await.unwrap();
    harness
        .wait_for_state(&status.id, RequestState::Running, Duration::from_secs(5))
        .await;
    let job_id = harness.latest_job_id(&status.id).await;
    let callback = harness.signed_callback(
        &job_id,
        CallbackStatus::Failed,
        None,
        Some("try-again".to_string()),
    );
    harness.manager.handle_callback(callback).await.unwrap();

    harness
        .wait_for_state(&status.id, RequestState::Succeeded, Duration::from_secs(5))
        .await;
    assert_eq!(harness.manager.status(&status.id).unwrap().attempts_made, 2);
}

#[tokio::test]
async fn test_per_worker_in_flight_cap_holds_second_job() {
    let capped = worker("w1")
        .kind("code_analysis")
        .capability(cap("code_analysis", "1.0.0", &["read"]))
        .max_in_flight(1)
        .build();
    let harness = Harness::start(vec![capped]).await;
    harness.transport.enqueue_async_ack(&"w1".into());
    harness.transport.enqueue_async_ack(&"w1".into());

    let first = harness.manager.submit(analysis_request()).await.unwrap();
    let second = harness.manager.submit(analysis_request()).await.unwrap();

    harness
        .wait_for_state(&first.id, RequestState::Running, Duration::from_secs(5))
        .await;
    // The cap keeps the second attempt out of `running`.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        harness.manager.status(&second.id).unwrap().state,
        RequestState::Queued
    );

    let first_job = harness.latest_job_id(&first.id).await;
    let callback = harness.signed_callback(
        &first_job,
        CallbackStatus::Completed,
        Some(Payload::new(b"one".to_vec(), "text/plain")),
        None,
    );
    harness.manager.handle_callback(callback).await.unwrap();
    harness
        .wait_for_state(&first.id, RequestState::Succeeded, Duration::from_secs(5))
        .await;

    harness
        .wait_for_state(&second.id, RequestState::Running, Duration::from_secs(5))
        .await;
    let second_job = harness.latest_job_id(&second.id).await;
    let callback = harness.signed_callback(
        &second_job,
        CallbackStatus::Completed,
        Some(Payload::new(b"two".to_vec(), "text/plain")),
        None,
    );
    harness.manager.handle_callback(callback).await.unwrap();
    harness
        .wait_for_state(&second.id, RequestState::Succeeded, Duration::from_secs(5))
        .await;
}

#[tokio::test]
async fn test_drain_holds_queued_work() {
    let harness = Harness::start(vec![analysis_worker()]).await;
    harness.manager.set_draining(true);

    let status = harness.manager.submit(analysis_request()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        harness.manager.status(&status.id).unwrap().state,
        RequestState::Queued
    );
    assert_eq!(harness.transport.dispatch_count(), 0);

    harness.manager.set_draining(false);
    harness
        .wait_for_state(&status.id, RequestState::Succeeded, Duration::from_secs(5))
        .await;
}

#[tokio::test]
async fn test_recovery_reenqueues_interrupted_jobs() {
    // First life: a running job is persisted, then the process "dies".
    let state = Arc::new(MemoryStateStore::new());
    let req = request("alice", "code_analysis");
    let mut persisted_req = req.clone();
    persisted_req.state = RequestState::Running;
    state.upsert_request(&persisted_req).await.unwrap();
    let mut job = foreman_protocol::Job::new(
        req.id.clone(),
        "w1".into(),
        "alice",
        1,
        Duration::from_secs(300),
    );
    job.state = JobState::Running;
    state.upsert_job(&job).await.unwrap();

    // Second life: fresh manager over the same state store.
    let transport = Arc::new(MockTransport::new());
    let registry = Arc::new(Registry::new(transport.clone(), RegistryConfig::default()));
    registry.register(analysis_worker());
    registry.probe_all().await;
    let results = Arc::new(ResultStore::new(
        state.clone(),
        Arc::new(MemoryBlobBackend::new()),
        StoreConfig::default(),
    ));
    let in_flight = Arc::new(InFlightTracker::new());
    let router = Arc::new(Router::new(
        registry.clone(),
        in_flight.clone(),
        RouterConfig::default(),
    ));
    let signer = Arc::new(
        EnvelopeSigner::from_pem(keys::TEST_RSA_PRIVATE.as_bytes(), "foreman", TTL).unwrap(),
    );
    let verifier = Arc::new(
        EnvelopeVerifier::from_pems(&[keys::TEST_RSA_PUBLIC.as_bytes()], TTL, SKEW).unwrap(),
    );
    let manager = Arc::new(JobManager::new(
        registry,
        router,
        signer,
        verifier,
        transport.clone(),
        results,
        state.clone(),
        in_flight,
        DispatchConfig::default(),
    ));

    let recovered = manager.recover().await.unwrap();
    assert_eq!(recovered, 1);

    // The lost attempt was burned and a successor queued.
    let jobs = state.jobs_for_request(&req.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert_eq!(jobs[1].state, JobState::Queued);
    assert_eq!(jobs[1].attempt, 2);

    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(manager.clone().run_dispatcher(rx));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if manager.status(&req.id).map(|s| s.state) == Some(RequestState::Succeeded) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "recovery never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let _ = shutdown.send(true);
}
