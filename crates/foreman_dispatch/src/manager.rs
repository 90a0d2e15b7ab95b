//! Job manager: the state machine driving every dispatch attempt.
//!
//! A single dispatcher task drains the priority queue and launches one
//! executor task per job, bounded by a global semaphore and per-worker
//! in-flight caps. Executors mint an envelope, call the worker, await a
//! verified callback when the worker went async, and finalize: write the
//! result, transition the state, count the outcome. Retriable failures
//! re-enter the queue as a fresh job (attempt + 1) after an exponential
//! backoff; a job itself never runs twice.

use crate::backoff;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::JobQueue;
use chrono::Utc;
use foreman_envelope::{EnvelopeDraft, EnvelopeSigner, EnvelopeVerifier};
use foreman_protocol::wire::{CallbackPayload, CallbackStatus, ExecuteRequest};
use foreman_protocol::{
    DispatchError, EnvelopeError, ErrorKind, FailureInfo, Job, JobId, JobState,
    OrchestratorError, Request, RequestId, RequestState, RequestStatus, ResultId, RoutingFlags,
    WorkerId,
};
use foreman_registry::RegistryReader;
use foreman_router::{RouteDecision, Router, WorkerLoad};
use foreman_state::{RouteDecisionRecord, StateStore};
use foreman_store::{PutHints, ResultStore};
use foreman_transport::{DispatchOutcome, WorkerTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Job manager tunables.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Global cap on concurrently running jobs.
    pub max_concurrent: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Callback URL advertised to async workers.
    pub callback_url: String,
    /// Pause before re-offering a job that could not acquire a bound.
    pub blocked_requeue_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        use foreman_protocol::defaults::*;
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            backoff_cap: Duration::from_secs(DEFAULT_BACKOFF_CAP_SECS),
            callback_url: DEFAULT_CALLBACK_URL.to_string(),
            blocked_requeue_delay: Duration::from_millis(50),
        }
    }
}

/// Per-worker running-job counts. Shared with the router for tie-breaks.
#[derive(Default)]
pub struct InFlightTracker {
    counts: Mutex<HashMap<WorkerId, u32>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot if the worker is under `cap`.
    fn try_acquire(&self, id: &WorkerId, cap: u32) -> bool {
        let mut counts = self.counts.lock().expect("in-flight lock poisoned");
        let count = counts.entry(id.clone()).or_insert(0);
        if *count >= cap {
            return false;
        }
        *count += 1;
        true
    }

    fn release(&self, id: &WorkerId) {
        let mut counts = self.counts.lock().expect("in-flight lock poisoned");
        if let Some(count) = counts.get_mut(id) {
            *count = count.saturating_sub(1);
        }
    }
}

impl WorkerLoad for InFlightTracker {
    fn in_flight(&self, id: &WorkerId) -> u32 {
        let counts = self.counts.lock().expect("in-flight lock poisoned");
        counts.get(id).copied().unwrap_or(0)
    }
}

/// How one attempt ended, before finalization.
enum AttemptEnd {
    Success {
        bytes: Vec<u8>,
        content_type: String,
    },
    Fail {
        kind: ErrorKind,
        message: String,
        retriable: bool,
    },
    Cancelled,
    /// The popped job was already terminal (e.g. cancelled while queued).
    Skipped,
}

struct RequestRecord {
    request: Request,
    attempts_made: u32,
    last_worker: Option<WorkerId>,
    error: Option<FailureInfo>,
    result_id: Option<ResultId>,
    cancel_requested: bool,
    active_job: Option<JobId>,
    cancel_notify: Arc<Notify>,
}

impl RequestRecord {
    fn new(request: Request) -> Self {
        Self {
            request,
            attempts_made: 0,
            last_worker: None,
            error: None,
            result_id: None,
            cancel_requested: false,
            active_job: None,
            cancel_notify: Arc::new(Notify::new()),
        }
    }

    fn status(&self) -> RequestStatus {
        RequestStatus {
            id: self.request.id.clone(),
            state: self.request.state,
            attempts_made: self.attempts_made,
            last_worker_id: self.last_worker.clone(),
            result_id: self.result_id.clone(),
            error: self.error.clone(),
        }
    }
}

pub struct JobManager {
    registry: Arc<dyn RegistryReader>,
    router: Arc<Router>,
    signer: Arc<EnvelopeSigner>,
    verifier: Arc<EnvelopeVerifier>,
    transport: Arc<dyn WorkerTransport>,
    results: Arc<ResultStore>,
    state: Arc<dyn StateStore>,
    queue: Arc<JobQueue>,
    requests: Mutex<HashMap<RequestId, RequestRecord>>,
    jobs: Mutex<HashMap<JobId, Job>>,
    pending_callbacks: Mutex<HashMap<JobId, oneshot::Sender<CallbackPayload>>>,
    in_flight: Arc<InFlightTracker>,
    slots: Arc<Semaphore>,
    metrics: Metrics,
    draining: AtomicBool,
    config: DispatchConfig,
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn RegistryReader>,
        router: Arc<Router>,
        signer: Arc<EnvelopeSigner>,
        verifier: Arc<EnvelopeVerifier>,
        transport: Arc<dyn WorkerTransport>,
        results: Arc<ResultStore>,
        state: Arc<dyn StateStore>,
        in_flight: Arc<InFlightTracker>,
        config: DispatchConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            registry,
            router,
            signer,
            verifier,
            transport,
            results,
            state,
            queue: Arc::new(JobQueue::new()),
            requests: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            pending_callbacks: Mutex::new(HashMap::new()),
            in_flight,
            slots,
            metrics: Metrics::new(),
            draining: AtomicBool::new(false),
            config,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Operator control: stop launching new jobs, let in-flight finish.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
        info!(draining, "drain flag changed");
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Accept a request: route it, open the job record, enqueue.
    pub async fn submit(&self, mut request: Request) -> Result<RequestStatus, OrchestratorError> {
        {
            let requests = self.requests.lock().expect("request lock poisoned");
            if requests.contains_key(&request.id) {
                return Err(OrchestratorError::InternalInvariant(format!(
                    "request {} already submitted",
                    request.id
                )));
            }
        }

        let (worker, decision) = match self.router.route_full(&request) {
            Ok(choice) => choice,
            Err(e) => {
                request.state = RequestState::Failed;
                self.persist_request(&request).await;
                let mut record = RequestRecord::new(request);
                record.error = Some(FailureInfo {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                self.requests
                    .lock()
                    .expect("request lock poisoned")
                    .insert(record.request.id.clone(), record);
                return Err(e);
            }
        };
        if let Some(decision) = decision {
            self.persist_decision(&decision).await;
        }

        request.state = RequestState::Queued;
        self.persist_request(&request).await;

        let priority = request.priority;
        let deadline = effective_deadline(&request, &worker.flags);
        let job = Job::new(
            request.id.clone(),
            worker.id.clone(),
            request.owner.clone(),
            1,
            deadline,
        );
        self.persist_job(&job).await;

        let status = {
            let mut requests = self.requests.lock().expect("request lock poisoned");
            let mut record = RequestRecord::new(request);
            record.active_job = Some(job.id.clone());
            record.last_worker = Some(worker.id.clone());
            let status = record.status();
            requests.insert(record.request.id.clone(), record);
            status
        };
        self.jobs
            .lock()
            .expect("job lock poisoned")
            .insert(job.id.clone(), job.clone());
        self.queue.push(job.id.clone(), priority);
        debug!(request = %job.request_id, job = %job.id, worker = %job.worker_id, "job enqueued");
        Ok(status)
    }

    /// Caller-visible view of a request.
    pub fn status(&self, request_id: &RequestId) -> Option<RequestStatus> {
        let requests = self.requests.lock().expect("request lock poisoned");
        requests.get(request_id).map(RequestRecord::status)
    }

    /// Cancel a request. Idempotent; returns false for unknown ids.
    pub async fn cancel(&self, request_id: &RequestId) -> bool {
        let (request, active_job, notify) = {
            let mut requests = self.requests.lock().expect("request lock poisoned");
            let Some(record) = requests.get_mut(request_id) else {
                return false;
            };
            if record.request.state.is_terminal() {
                return true;
            }
            record.cancel_requested = true;
            record.request.state = RequestState::Cancelled;
            (
                record.request.clone(),
                record.active_job.take(),
                record.cancel_notify.clone(),
            )
        };
        self.persist_request(&request).await;

        if let Some(job_id) = active_job {
            let cancelled_while_queued = {
                let mut jobs = self.jobs.lock().expect("job lock poisoned");
                match jobs.get_mut(&job_id) {
                    Some(job) if job.state == JobState::Queued => {
                        job.state = JobState::Cancelled;
                        job.finished_at = Some(Utc::now());
                        Some(job.clone())
                    }
                    // A running job is finalized by its executor when the
                    // notify below wakes it.
                    _ => None,
                }
            };
            if let Some(job) = cancelled_while_queued {
                self.persist_job(&job).await;
                Metrics::inc(&self.metrics.jobs_cancelled);
            }
        }
        notify.notify_waiters();
        info!(request = %request_id, "request cancelled");
        true
    }

    /// Ingest an async worker callback. The envelope must verify and its
    /// task id must match the body; duplicates and post-terminal
    /// callbacks are silently ignored.
    pub async fn handle_callback(
        &self,
        callback: CallbackPayload,
    ) -> Result<(), OrchestratorError> {
        let Some(token) = callback.envelope_jwt.as_deref() else {
            Metrics::inc(&self.metrics.callbacks_rejected);
            return Err(OrchestratorError::EnvelopeInvalid(EnvelopeError::Malformed(
                "callback missing envelope".to_string(),
            )));
        };
        let claims = self.verifier.verify(token).map_err(|e| {
            Metrics::inc(&self.metrics.callbacks_rejected);
            OrchestratorError::EnvelopeInvalid(e)
        })?;
        if claims.task_id != callback.task_id {
            Metrics::inc(&self.metrics.callbacks_rejected);
            return Err(OrchestratorError::EnvelopeInvalid(
                EnvelopeError::WrongAudience,
            ));
        }

        let sender = self
            .pending_callbacks
            .lock()
            .expect("callback lock poisoned")
            .remove(&callback.task_id);
        match sender {
            Some(tx) => {
                Metrics::inc(&self.metrics.callbacks_accepted);
                let _ = tx.send(callback);
            }
            None => {
                debug!(task = %callback.task_id, "callback for unknown or finished job ignored");
            }
        }
        Ok(())
    }

    /// Re-enqueue interrupted work found in durable storage at startup.
    /// Returns how many jobs were brought back.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, OrchestratorError> {
        let active = self
            .state
            .active_jobs()
            .await
            .map_err(|e| OrchestratorError::StorageFailure(e.to_string()))?;
        let mut recovered = 0usize;
        for mut job in active {
            let request = self
                .state
                .get_request(&job.request_id)
                .await
                .map_err(|e| OrchestratorError::StorageFailure(e.to_string()))?;
            let Some(request) = request else {
                warn!(job = %job.id, "active job without request; marking failed");
                job.state = JobState::Failed;
                job.last_error = Some("request record missing".to_string());
                self.persist_job(&job).await;
                continue;
            };
            if request.state.is_terminal() {
                job.state = JobState::Cancelled;
                job.finished_at = Some(Utc::now());
                self.persist_job(&job).await;
                continue;
            }

            {
                let mut requests = self.requests.lock().expect("request lock poisoned");
                requests.entry(request.id.clone()).or_insert_with(|| {
                    let mut record = RequestRecord::new(request.clone());
                    record.attempts_made = job.attempt.saturating_sub(1);
                    record.last_worker = Some(job.worker_id.clone());
                    record
                });
            }

            match job.state {
                JobState::Queued => {
                    {
                        let mut requests =
                            self.requests.lock().expect("request lock poisoned");
                        if let Some(record) = requests.get_mut(&job.request_id) {
                            record.active_job = Some(job.id.clone());
                        }
                    }
                    self.jobs
                        .lock()
                        .expect("job lock poisoned")
                        .insert(job.id.clone(), job.clone());
                    self.queue.push(job.id.clone(), request.priority);
                    recovered += 1;
                    info!(job = %job.id, "recovered queued job");
                }
                JobState::Running => {
                    // The in-flight attempt is lost; burn it and retry.
                    job.state = JobState::Failed;
                    job.last_error = Some("orchestrator restarted mid-flight".to_string());
                    job.finished_at = Some(Utc::now());
                    self.persist_job(&job).await;
                    {
                        let mut requests =
                            self.requests.lock().expect("request lock poisoned");
                        if let Some(record) = requests.get_mut(&job.request_id) {
                            record.attempts_made = job.attempt;
                        }
                    }
                    if job.attempt < request.max_attempts {
                        if self.spawn_successor(&request, job.attempt + 1).await {
                            recovered += 1;
                            info!(request = %request.id, "recovered interrupted job as new attempt");
                        }
                    } else {
                        self.fail_request(
                            &request.id,
                            FailureInfo {
                                kind: ErrorKind::DispatchFailed,
                                message: "lost in restart after final attempt".to_string(),
                            },
                        )
                        .await;
                    }
                }
                _ => {}
            }
        }
        Ok(recovered)
    }

    /// Dispatcher: drain the queue and launch executors until shutdown.
    pub async fn run_dispatcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let entry = tokio::select! {
                entry = self.queue.pop() => entry,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatcher stopping");
                        return;
                    }
                    continue;
                }
            };

            if self.is_draining() {
                self.queue.push_back(entry);
                tokio::time::sleep(self.config.blocked_requeue_delay).await;
                continue;
            }

            let job = {
                let jobs = self.jobs.lock().expect("job lock poisoned");
                jobs.get(&entry.job_id).cloned()
            };
            let Some(job) = job else { continue };
            if job.state != JobState::Queued {
                continue;
            }

            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatcher stopping");
                        return;
                    }
                    self.queue.push_back(entry);
                    continue;
                }
            };

            let cap = self
                .registry
                .get(&job.worker_id)
                .map(|d| d.flags.max_in_flight)
                .unwrap_or(foreman_protocol::defaults::DEFAULT_WORKER_MAX_IN_FLIGHT);
            if !self.in_flight.try_acquire(&job.worker_id, cap) {
                // Returned without consuming an attempt; keeps its place.
                drop(permit);
                self.queue.push_back(entry);
                tokio::time::sleep(self.config.blocked_requeue_delay).await;
                continue;
            }

            let manager = self.clone();
            let job_id = job.id.clone();
            let worker_id = job.worker_id.clone();
            tokio::spawn(async move {
                let end = manager.run_attempt(&job_id).await;
                manager.in_flight.release(&worker_id);
                match end {
                    AttemptEnd::Skipped => {}
                    AttemptEnd::Success {
                        bytes,
                        content_type,
                    } => manager.finalize_success(&job_id, bytes, content_type).await,
                    AttemptEnd::Cancelled => manager.finalize_cancelled(&job_id).await,
                    AttemptEnd::Fail {
                        kind,
                        message,
                        retriable,
                    } => {
                        manager
                            .finalize_failure(&job_id, kind, message, retriable)
                            .await
                    }
                }
                drop(permit);
            });
        }
    }

    /// One dispatch attempt, from queued to an [`AttemptEnd`].
    async fn run_attempt(&self, job_id: &JobId) -> AttemptEnd {
        let Some(mut job) = self.job_snapshot(job_id) else {
            return AttemptEnd::Skipped;
        };
        if job.state != JobState::Queued {
            return AttemptEnd::Skipped;
        }
        let Some((request, cancel_notify, cancel_requested)) =
            self.request_snapshot(&job.request_id)
        else {
            return AttemptEnd::Fail {
                kind: ErrorKind::InternalInvariant,
                message: "job without request record".to_string(),
                retriable: false,
            };
        };
        if cancel_requested {
            return AttemptEnd::Cancelled;
        }

        job.state = JobState::Running;
        job.started_at = Some(Utc::now());
        self.store_job(job.clone()).await;
        if let Some(updated) = self.mark_request_state(&job.request_id, RequestState::Running) {
            self.persist_request(&updated).await;
        }
        Metrics::inc(&self.metrics.jobs_dispatched);

        let Some(worker) = self.registry.get(&job.worker_id) else {
            return AttemptEnd::Fail {
                kind: ErrorKind::WorkerUnhealthy,
                message: format!("worker {} disappeared before dispatch", job.worker_id),
                retriable: true,
            };
        };
        if !self.registry.is_routable(&job.worker_id) {
            return AttemptEnd::Fail {
                kind: ErrorKind::WorkerUnhealthy,
                message: format!("worker {} became unroutable", job.worker_id),
                retriable: true,
            };
        }

        let draft = EnvelopeDraft {
            task_id: job.id.clone(),
            owner: request.owner.clone(),
            payload_digest: request.payload.digest(),
            repo_url: request.metadata.get("repo_url").cloned(),
            content_ref: request.metadata.get("ref").cloned(),
            callback_url: self.config.callback_url.clone(),
            consent_given: worker.flags.runs_on_user_compute,
        };
        let token = match self.signer.sign(draft) {
            Ok(token) => token,
            Err(e) => {
                return AttemptEnd::Fail {
                    kind: ErrorKind::EnvelopeInvalid,
                    message: e.to_string(),
                    retriable: false,
                }
            }
        };

        let deadline = job.deadline();
        let started = Instant::now();
        let execute = ExecuteRequest {
            envelope_jwt: token,
            payload: request.payload.clone(),
            callback_url: self.config.callback_url.clone(),
        };

        // Registered before the call so a worker that calls back faster
        // than its HTTP response cannot race past us.
        let (tx, rx) = oneshot::channel();
        self.pending_callbacks
            .lock()
            .expect("callback lock poisoned")
            .insert(job.id.clone(), tx);

        let outcome = tokio::select! {
            outcome = self.transport.dispatch(&worker, execute, deadline) => outcome,
            _ = cancel_notify.notified() => {
                self.drop_pending(&job.id);
                return AttemptEnd::Cancelled;
            }
        };

        match outcome {
            Err(DispatchError::Timeout) => {
                self.drop_pending(&job.id);
                Metrics::inc(&self.metrics.jobs_timed_out);
                AttemptEnd::Fail {
                    kind: ErrorKind::JobTimeout,
                    message: "worker did not answer within the deadline".to_string(),
                    retriable: true,
                }
            }
            // Workers decline a capability they cannot honor with 412;
            // never retried against the same worker, so not at all here.
            Err(DispatchError::Http4xx(412)) => {
                self.drop_pending(&job.id);
                AttemptEnd::Fail {
                    kind: ErrorKind::CapabilityMismatch,
                    message: "worker declined: capability version or parameters did not match"
                        .to_string(),
                    retriable: false,
                }
            }
            Err(e) => {
                self.drop_pending(&job.id);
                AttemptEnd::Fail {
                    kind: ErrorKind::DispatchFailed,
                    retriable: e.is_retriable(),
                    message: e.to_string(),
                }
            }
            Ok(DispatchOutcome::Direct {
                bytes,
                content_type,
            }) => {
                self.drop_pending(&job.id);
                AttemptEnd::Success {
                    bytes,
                    content_type,
                }
            }
            Ok(DispatchOutcome::AcceptedAsync { task_id }) => {
                if task_id != job.id {
                    self.drop_pending(&job.id);
                    return AttemptEnd::Fail {
                        kind: ErrorKind::DispatchFailed,
                        message: format!("worker acknowledged foreign task {task_id}"),
                        retriable: false,
                    };
                }
                // Re-check before parking on the callback: a cancel that
                // landed during the dispatch call must not be missed.
                if self.is_cancel_requested(&job.request_id) {
                    self.drop_pending(&job.id);
                    return AttemptEnd::Cancelled;
                }
                let remaining = deadline.saturating_sub(started.elapsed());
                tokio::select! {
                    callback = rx => match callback {
                        Ok(payload) => self.interpret_callback(&job.request_id, payload),
                        Err(_) => AttemptEnd::Fail {
                            kind: ErrorKind::InternalInvariant,
                            message: "callback channel closed".to_string(),
                            retriable: false,
                        },
                    },
                    _ = tokio::time::sleep(remaining) => {
                        self.drop_pending(&job.id);
                        Metrics::inc(&self.metrics.jobs_timed_out);
                        AttemptEnd::Fail {
                            kind: ErrorKind::JobTimeout,
                            message: "worker accepted the job but never called back".to_string(),
                            retriable: true,
                        }
                    }
                    _ = cancel_notify.notified() => {
                        self.drop_pending(&job.id);
                        AttemptEnd::Cancelled
                    }
                }
            }
        }
    }

    fn interpret_callback(&self, request_id: &RequestId, payload: CallbackPayload) -> AttemptEnd {
        if self.is_cancel_requested(request_id) {
            return AttemptEnd::Cancelled;
        }
        match payload.status {
            CallbackStatus::Completed => match payload.results {
                Some(results) => AttemptEnd::Success {
                    bytes: results.bytes,
                    content_type: results.content_type,
                },
                None => AttemptEnd::Fail {
                    kind: ErrorKind::DispatchFailed,
                    message: "completed callback carried no results".to_string(),
                    retriable: false,
                },
            },
            CallbackStatus::Failed => {
                let message = payload
                    .error
                    .unwrap_or_else(|| "worker reported failure".to_string());
                let retriable = message == "try-again";
                AttemptEnd::Fail {
                    kind: ErrorKind::DispatchFailed,
                    message,
                    retriable,
                }
            }
        }
    }

    async fn finalize_success(
        self: &Arc<Self>,
        job_id: &JobId,
        bytes: Vec<u8>,
        content_type: String,
    ) {
        let Some(mut job) = self.job_snapshot(job_id) else {
            return;
        };
        if job.state != JobState::Running {
            // Cancelled under us; the artifact is discarded.
            return;
        }
        if self.is_cancel_requested(&job.request_id) {
            self.finalize_cancelled(job_id).await;
            return;
        }

        let hints = PutHints {
            prefer_pointer: self
                .registry
                .get(&job.worker_id)
                .map(|d| d.flags.prefers_pointer_result)
                .unwrap_or(false),
            content_type,
        };
        // One in-process retry on storage trouble, then give up and fail
        // the job; the artifact is discarded.
        let stored = match self
            .results
            .put(&job.owner, &job.request_id, bytes.clone(), hints.clone())
            .await
        {
            Ok(result) => Ok(result),
            Err(first) => {
                Metrics::inc(&self.metrics.storage_errors);
                warn!(job = %job.id, error = %first, "result write failed; retrying once");
                self.results
                    .put(&job.owner, &job.request_id, bytes, hints)
                    .await
            }
        };
        let result = match stored {
            Ok(result) => result,
            Err(e) => {
                Metrics::inc(&self.metrics.storage_errors);
                self.finalize_failure(
                    job_id,
                    ErrorKind::StorageFailure,
                    e.to_string(),
                    false,
                )
                .await;
                return;
            }
        };

        job.state = JobState::Succeeded;
        job.finished_at = Some(Utc::now());
        self.store_job(job.clone()).await;

        let request = {
            let mut requests = self.requests.lock().expect("request lock poisoned");
            requests.get_mut(&job.request_id).map(|record| {
                record.request.state = RequestState::Succeeded;
                record.attempts_made = job.attempt;
                record.last_worker = Some(job.worker_id.clone());
                record.result_id = Some(result.id.clone());
                record.active_job = None;
                record.request.clone()
            })
        };
        if let Some(request) = request {
            self.persist_request(&request).await;
        }

        Metrics::inc(&self.metrics.jobs_succeeded);
        self.note_duration(&job);
        info!(job = %job.id, request = %job.request_id, attempt = job.attempt, "job succeeded");
    }

    async fn finalize_failure(
        self: &Arc<Self>,
        job_id: &JobId,
        kind: ErrorKind,
        message: String,
        retriable: bool,
    ) {
        let Some(mut job) = self.job_snapshot(job_id) else {
            return;
        };
        if job.state.is_terminal() {
            return;
        }
        if self.is_cancel_requested(&job.request_id) {
            self.finalize_cancelled(job_id).await;
            return;
        }

        job.state = JobState::Failed;
        job.finished_at = Some(Utc::now());
        job.last_error = Some(message.clone());
        self.store_job(job.clone()).await;

        let (request, may_retry) = {
            let mut requests = self.requests.lock().expect("request lock poisoned");
            let Some(record) = requests.get_mut(&job.request_id) else {
                return;
            };
            record.attempts_made = job.attempt;
            record.last_worker = Some(job.worker_id.clone());
            record.active_job = None;
            let may_retry =
                retriable && job.attempt < record.request.max_attempts && !record.cancel_requested;
            if may_retry {
                record.request.state = RequestState::Queued;
            } else {
                record.request.state = RequestState::Failed;
                record.error = Some(FailureInfo {
                    kind,
                    message: message.clone(),
                });
            }
            (record.request.clone(), may_retry)
        };
        self.persist_request(&request).await;
        self.note_duration(&job);

        if may_retry {
            Metrics::inc(&self.metrics.jobs_retried);
            let delay = backoff::delay(job.attempt, self.config.backoff_base, self.config.backoff_cap);
            warn!(
                request = %job.request_id,
                attempt = job.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "attempt failed; retrying"
            );
            let manager = Arc::clone(self);
            let request_id = job.request_id.clone();
            let next_attempt = job.attempt + 1;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.retry(&request_id, next_attempt).await;
            });
        } else {
            Metrics::inc(&self.metrics.jobs_failed);
            warn!(
                request = %job.request_id,
                attempt = job.attempt,
                kind = %kind,
                error = %message,
                "request failed terminally"
            );
            let failure = FailureInfo { kind, message };
            match self
                .results
                .put_failure(&job.owner, &job.request_id, failure)
                .await
            {
                Ok(result) => {
                    let mut requests = self.requests.lock().expect("request lock poisoned");
                    if let Some(record) = requests.get_mut(&job.request_id) {
                        record.result_id = Some(result.id);
                    }
                }
                Err(e) => {
                    Metrics::inc(&self.metrics.storage_errors);
                    error!(request = %job.request_id, error = %e, "failed to store error result");
                }
            }
        }
    }

    async fn finalize_cancelled(self: &Arc<Self>, job_id: &JobId) {
        let Some(mut job) = self.job_snapshot(job_id) else {
            return;
        };
        if !job.state.is_terminal() {
            job.state = JobState::Cancelled;
            job.finished_at = Some(Utc::now());
            self.store_job(job.clone()).await;
            Metrics::inc(&self.metrics.jobs_cancelled);
        }
        let mut requests = self.requests.lock().expect("request lock poisoned");
        if let Some(record) = requests.get_mut(&job.request_id) {
            record.attempts_made = record.attempts_made.max(job.attempt);
            if record.active_job.as_ref() == Some(job_id) {
                record.active_job = None;
            }
        }
        debug!(job = %job.id, request = %job.request_id, "job cancelled");
    }

    async fn retry(self: &Arc<Self>, request_id: &RequestId, attempt: u32) {
        let request = {
            let requests = self.requests.lock().expect("request lock poisoned");
            let Some(record) = requests.get(request_id) else {
                return;
            };
            if record.cancel_requested || record.request.state.is_terminal() {
                return;
            }
            if record.active_job.is_some() {
                error!(
                    request = %request_id,
                    "invariant violation: retry while another job is active"
                );
                return;
            }
            record.request.clone()
        };
        self.spawn_successor(&request, attempt).await;
    }

    /// Route and enqueue the next attempt. Returns false when routing
    /// failed and the request was finalized instead.
    async fn spawn_successor(self: &Arc<Self>, request: &Request, attempt: u32) -> bool {
        match self.router.route_full(request) {
            Ok((worker, decision)) => {
                if let Some(decision) = decision {
                    self.persist_decision(&decision).await;
                }
                let deadline = effective_deadline(request, &worker.flags);
                let job = Job::new(
                    request.id.clone(),
                    worker.id.clone(),
                    request.owner.clone(),
                    attempt,
                    deadline,
                );
                self.persist_job(&job).await;
                let request_snapshot = {
                    let mut requests = self.requests.lock().expect("request lock poisoned");
                    match requests.get_mut(&request.id) {
                        Some(record) => {
                            record.active_job = Some(job.id.clone());
                            record.last_worker = Some(worker.id.clone());
                            record.request.state = RequestState::Queued;
                            Some(record.request.clone())
                        }
                        None => None,
                    }
                };
                if let Some(snapshot) = request_snapshot {
                    self.persist_request(&snapshot).await;
                }
                self.jobs
                    .lock()
                    .expect("job lock poisoned")
                    .insert(job.id.clone(), job.clone());
                self.queue.push(job.id.clone(), request.priority);
                debug!(request = %request.id, job = %job.id, attempt, "successor attempt enqueued");
                true
            }
            Err(e) => {
                self.fail_request(
                    &request.id,
                    FailureInfo {
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                )
                .await;
                false
            }
        }
    }

    async fn fail_request(self: &Arc<Self>, request_id: &RequestId, failure: FailureInfo) {
        let request = {
            let mut requests = self.requests.lock().expect("request lock poisoned");
            let Some(record) = requests.get_mut(request_id) else {
                return;
            };
            record.request.state = RequestState::Failed;
            record.error = Some(failure.clone());
            record.active_job = None;
            record.request.clone()
        };
        self.persist_request(&request).await;
        Metrics::inc(&self.metrics.jobs_failed);
        match self
            .results
            .put_failure(&request.owner, request_id, failure)
            .await
        {
            Ok(result) => {
                let mut requests = self.requests.lock().expect("request lock poisoned");
                if let Some(record) = requests.get_mut(request_id) {
                    record.result_id = Some(result.id);
                }
            }
            Err(e) => {
                Metrics::inc(&self.metrics.storage_errors);
                error!(request = %request_id, error = %e, "failed to store error result");
            }
        }
    }

    fn job_snapshot(&self, job_id: &JobId) -> Option<Job> {
        let jobs = self.jobs.lock().expect("job lock poisoned");
        jobs.get(job_id).cloned()
    }

    fn request_snapshot(&self, request_id: &RequestId) -> Option<(Request, Arc<Notify>, bool)> {
        let requests = self.requests.lock().expect("request lock poisoned");
        requests.get(request_id).map(|record| {
            (
                record.request.clone(),
                record.cancel_notify.clone(),
                record.cancel_requested,
            )
        })
    }

    fn mark_request_state(&self, request_id: &RequestId, state: RequestState) -> Option<Request> {
        let mut requests = self.requests.lock().expect("request lock poisoned");
        requests.get_mut(request_id).and_then(|record| {
            if record.request.state.is_terminal() {
                return None;
            }
            record.request.state = state;
            Some(record.request.clone())
        })
    }

    fn is_cancel_requested(&self, request_id: &RequestId) -> bool {
        let requests = self.requests.lock().expect("request lock poisoned");
        requests
            .get(request_id)
            .map(|record| record.cancel_requested)
            .unwrap_or(false)
    }

    fn drop_pending(&self, job_id: &JobId) {
        self.pending_callbacks
            .lock()
            .expect("callback lock poisoned")
            .remove(job_id);
    }

    fn note_duration(&self, job: &Job) {
        if let (Some(started), Some(finished)) = (job.started_at, job.finished_at) {
            let micros = (finished - started).num_microseconds().unwrap_or(0).max(0) as u64;
            self.metrics.add_duration_us(micros);
        }
    }

    async fn store_job(&self, job: Job) {
        self.jobs
            .lock()
            .expect("job lock poisoned")
            .insert(job.id.clone(), job.clone());
        self.persist_job(&job).await;
    }

    async fn persist_request(&self, request: &Request) {
        if let Err(e) = self.state.upsert_request(request).await {
            Metrics::inc(&self.metrics.storage_errors);
            error!(request = %request.id, error = %e, "failed to persist request");
        }
    }

    async fn persist_job(&self, job: &Job) {
        if let Err(e) = self.state.upsert_job(job).await {
            Metrics::inc(&self.metrics.storage_errors);
            error!(job = %job.id, error = %e, "failed to persist job");
        }
    }

    async fn persist_decision(&self, decision: &RouteDecision) {
        let record = RouteDecisionRecord {
            request_id: decision.request_id.clone(),
            worker_id: decision.worker_id.clone(),
            total_score: decision.breakdown.total,
            breakdown_json: serde_json::to_string(&decision.breakdown)
                .unwrap_or_else(|_| "{}".to_string()),
            decided_at: decision.decided_at,
        };
        if let Err(e) = self.state.append_decision(&record).await {
            Metrics::inc(&self.metrics.storage_errors);
            warn!(error = %e, "failed to persist routing decision");
        }
    }
}

fn effective_deadline(request: &Request, flags: &RoutingFlags) -> Duration {
    match request.deadline() {
        Some(requested) => requested.min(flags.default_deadline()),
        None => flags.default_deadline(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_deadline_takes_minimum() {
        let mut flags = RoutingFlags::default();
        flags.default_deadline_secs = 120;
        let request = foreman_protocol::Request::new(
            "alice",
            "code_analysis",
            foreman_protocol::Payload::default(),
        )
        .with_deadline(Duration::from_secs(30));
        assert_eq!(effective_deadline(&request, &flags), Duration::from_secs(30));

        let no_deadline = foreman_protocol::Request::new(
            "alice",
            "code_analysis",
            foreman_protocol::Payload::default(),
        );
        assert_eq!(
            effective_deadline(&no_deadline, &flags),
            Duration::from_secs(120)
        );

        let long = foreman_protocol::Request::new(
            "alice",
            "code_analysis",
            foreman_protocol::Payload::default(),
        )
        .with_deadline(Duration::from_secs(600));
        assert_eq!(effective_deadline(&long, &flags), Duration::from_secs(120));
    }

    #[test]
    fn test_in_flight_tracker_caps() {
        let tracker = InFlightTracker::new();
        let id = WorkerId::from("w1");
        assert!(tracker.try_acquire(&id, 2));
        assert!(tracker.try_acquire(&id, 2));
        assert!(!tracker.try_acquire(&id, 2));
        assert_eq!(tracker.in_flight(&id), 2);
        tracker.release(&id);
        assert!(tracker.try_acquire(&id, 2));
    }
}
