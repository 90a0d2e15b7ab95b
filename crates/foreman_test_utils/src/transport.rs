//! Scripted in-memory transport.
//!
//! Tests enqueue per-worker outcomes; the mock plays them back in order
//! and records every dispatch it sees. An exhausted script falls back to
//! a direct `b"ok"` response so happy-path tests stay short.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use foreman_protocol::wire::{ExecuteRequest, HealthReport, WorkerManifest};
use foreman_protocol::{DispatchError, JobId, WorkerDescriptor, WorkerId};
use foreman_transport::{DispatchOutcome, WorkerTransport};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// One dispatch observed by the mock.
#[derive(Debug, Clone)]
pub struct RecordedDispatch {
    pub worker_id: WorkerId,
    pub request: ExecuteRequest,
    pub deadline: Duration,
}

enum Scripted {
    Outcome(Result<DispatchOutcome, DispatchError>),
    /// Accept asynchronously, echoing the task id from the envelope the
    /// way a real worker would.
    EchoAck,
}

#[derive(Default)]
pub struct MockTransport {
    dispatch_scripts: Mutex<HashMap<WorkerId, VecDeque<Scripted>>>,
    health_scripts: Mutex<HashMap<WorkerId, VecDeque<Result<HealthReport, DispatchError>>>>,
    manifests: Mutex<HashMap<String, WorkerManifest>>,
    dispatches: Mutex<Vec<RecordedDispatch>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next dispatch outcome for `worker_id`.
    pub fn enqueue_dispatch(
        &self,
        worker_id: &WorkerId,
        outcome: Result<DispatchOutcome, DispatchError>,
    ) {
        self.dispatch_scripts
            .lock()
            .unwrap()
            .entry(worker_id.clone())
            .or_default()
            .push_back(Scripted::Outcome(outcome));
    }

    /// Queue an async acceptance: the mock answers `accepted` with the
    /// task id taken from the dispatched envelope.
    pub fn enqueue_async_ack(&self, worker_id: &WorkerId) {
        self.dispatch_scripts
            .lock()
            .unwrap()
            .entry(worker_id.clone())
            .or_default()
            .push_back(Scripted::EchoAck);
    }

    /// Queue the next health-probe outcome for `worker_id`.
    pub fn enqueue_health(
        &self,
        worker_id: &WorkerId,
        outcome: Result<HealthReport, DispatchError>,
    ) {
        self.health_scripts
            .lock()
            .unwrap()
            .entry(worker_id.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Serve `manifest` for `manifest_url`.
    pub fn set_manifest(&self, manifest_url: &str, manifest: WorkerManifest) {
        self.manifests
            .lock()
            .unwrap()
            .insert(manifest_url.to_string(), manifest);
    }

    /// Everything dispatched so far, in call order.
    pub fn dispatches(&self) -> Vec<RecordedDispatch> {
        self.dispatches.lock().unwrap().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.lock().unwrap().len()
    }

    fn healthy_report() -> HealthReport {
        serde_json::from_str(r#"{"status":"healthy"}"#).expect("static report parses")
    }
}

/// Decode a JWT's claims WITHOUT verifying the signature. Test-only: lets
/// the mock worker echo the task id it was handed.
pub fn decode_claims_unverified(token: &str) -> serde_json::Value {
    let payload = token.split('.').nth(1).expect("jwt has three segments");
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .expect("jwt payload is base64url");
    serde_json::from_slice(&bytes).expect("jwt payload is json")
}

#[async_trait]
impl WorkerTransport for MockTransport {
    async fn dispatch(
        &self,
        worker: &WorkerDescriptor,
        request: ExecuteRequest,
        deadline: Duration,
    ) -> Result<DispatchOutcome, DispatchError> {
        let envelope_jwt = request.envelope_jwt.clone();
        self.dispatches.lock().unwrap().push(RecordedDispatch {
            worker_id: worker.id.clone(),
            request,
            deadline,
        });
        let scripted = self
            .dispatch_scripts
            .lock()
            .unwrap()
            .get_mut(&worker.id)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(Scripted::Outcome(outcome)) => outcome,
            Some(Scripted::EchoAck) => {
                let claims = decode_claims_unverified(&envelope_jwt);
                let task_id = claims
                    .get("task_id")
                    .and_then(|t| t.as_str())
                    .expect("envelope carries task_id");
                Ok(DispatchOutcome::AcceptedAsync {
                    task_id: JobId::parse(task_id).expect("task_id is a job id"),
                })
            }
            None => Ok(DispatchOutcome::Direct {
                bytes: b"ok".to_vec(),
                content_type: "text/plain".to_string(),
            }),
        }
    }

    async fn fetch_health(
        &self,
        worker: &WorkerDescriptor,
        _timeout: Duration,
    ) -> Result<HealthReport, DispatchError> {
        let scripted = self
            .health_scripts
            .lock()
            .unwrap()
            .get_mut(&worker.id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(Self::healthy_report()))
    }

    async fn fetch_manifest(
        &self,
        manifest_url: &str,
        _timeout: Duration,
    ) -> Result<WorkerManifest, DispatchError> {
        self.manifests
            .lock()
            .unwrap()
            .get(manifest_url)
            .cloned()
            .ok_or(DispatchError::Http4xx(404))
    }
}
