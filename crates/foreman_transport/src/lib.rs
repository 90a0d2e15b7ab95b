//! Outbound worker transport.
//!
//! One seam for everything that leaves the orchestrator: job dispatch,
//! health probes, and manifest fetches. The transport classifies failures
//! into [`DispatchError`] and NEVER retries; retry policy belongs to the
//! job manager.

use async_trait::async_trait;
use foreman_protocol::wire::{ExecuteRequest, HealthReport, WorkerManifest};
use foreman_protocol::{DispatchError, JobId, WorkerDescriptor};
use std::time::Duration;
use tracing::debug;

/// What a successful dispatch call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The worker answered with the artifact directly.
    Direct {
        bytes: Vec<u8>,
        content_type: String,
    },
    /// The worker accepted the job and will post to the callback URL.
    AcceptedAsync { task_id: JobId },
}

/// Outbound calls the orchestrator makes to workers.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Execute a signed envelope on `worker`. `deadline` bounds the call.
    async fn dispatch(
        &self,
        worker: &WorkerDescriptor,
        request: ExecuteRequest,
        deadline: Duration,
    ) -> Result<DispatchOutcome, DispatchError>;

    /// Fetch the worker's self-reported health.
    async fn fetch_health(
        &self,
        worker: &WorkerDescriptor,
        timeout: Duration,
    ) -> Result<HealthReport, DispatchError>;

    /// Fetch the manifest a user-hosted worker publishes.
    async fn fetch_manifest(
        &self,
        manifest_url: &str,
        timeout: Duration,
    ) -> Result<WorkerManifest, DispatchError>;
}

/// reqwest-backed transport used in production.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerTransport for HttpTransport {
    async fn dispatch(
        &self,
        worker: &WorkerDescriptor,
        request: ExecuteRequest,
        deadline: Duration,
    ) -> Result<DispatchOutcome, DispatchError> {
        let url = join_url(&worker.endpoint, "execute");
        debug!(worker = %worker.id, %url, deadline_secs = deadline.as_secs(), "dispatching job");

        let response = self
            .client
            .post(&url)
            .timeout(deadline)
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(classify_reqwest_error)?
            .to_vec();

        parse_execute_body(bytes, content_type)
    }

    async fn fetch_health(
        &self,
        worker: &WorkerDescriptor,
        timeout: Duration,
    ) -> Result<HealthReport, DispatchError> {
        let url = join_url(&worker.endpoint, "health");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16()));
        }
        response
            .json::<HealthReport>()
            .await
            .map_err(|e| DispatchError::MalformedResponse(e.to_string()))
    }

    async fn fetch_manifest(
        &self,
        manifest_url: &str,
        timeout: Duration,
    ) -> Result<WorkerManifest, DispatchError> {
        let url = join_url(manifest_url, "manifest.json");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16()));
        }
        response
            .json::<WorkerManifest>()
            .await
            .map_err(|e| DispatchError::MalformedResponse(e.to_string()))
    }
}

/// Interpret a 2xx execute body: an `{status: "accepted", task_id}` ack
/// means async completion; anything else is the artifact itself.
fn parse_execute_body(
    bytes: Vec<u8>,
    content_type: String,
) -> Result<DispatchOutcome, DispatchError> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
        if value.get("status").and_then(|s| s.as_str()) == Some("accepted") {
            let task_id = value
                .get("task_id")
                .and_then(|t| t.as_str())
                .ok_or_else(|| {
                    DispatchError::MalformedResponse("accepted ack without task_id".to_string())
                })?;
            let task_id = JobId::parse(task_id).map_err(|e| {
                DispatchError::MalformedResponse(format!("accepted ack task_id: {e}"))
            })?;
            return Ok(DispatchOutcome::AcceptedAsync { task_id });
        }
    }
    Ok(DispatchOutcome::Direct {
        bytes,
        content_type,
    })
}

fn classify_reqwest_error(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout
    } else {
        DispatchError::Network(err.to_string())
    }
}

fn classify_status(status: u16) -> DispatchError {
    match status {
        // Workers refuse envelopes with 401.
        401 => DispatchError::EnvelopeRejected,
        400..=499 => DispatchError::Http4xx(status),
        500..=599 => DispatchError::Http5xx(status),
        other => DispatchError::Network(format!("unexpected status {other}")),
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}
