//! Wire payloads exchanged with workers.

use crate::capability::Capability;
use crate::ids::{JobId, WorkerId};
use crate::request::Payload;
use crate::worker::{HealthStatus, RoutingFlags, WorkerDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body POSTed to a worker's execute endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub envelope_jwt: String,
    pub payload: Payload,
    pub callback_url: String,
}

/// Acknowledgement a worker returns when it will complete asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncAck {
    pub status: String,
    pub task_id: JobId,
}

impl AsyncAck {
    pub const ACCEPTED: &'static str = "accepted";

    pub fn is_accepted(&self) -> bool {
        self.status == Self::ACCEPTED
    }
}

/// Completion state reported on the callback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Completed,
    Failed,
}

/// Body an async worker POSTs back to `callback_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub task_id: JobId,
    pub status: CallbackStatus,
    pub results: Option<Payload>,
    pub error: Option<String>,
    /// Signed envelope proving the callback's origin; unsigned callbacks
    /// are rejected.
    pub envelope_jwt: Option<String>,
}

/// Health statuses a worker may self-report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedHealth {
    Healthy,
    Warning,
    Unhealthy,
}

impl From<ReportedHealth> for HealthStatus {
    fn from(reported: ReportedHealth) -> Self {
        match reported {
            ReportedHealth::Healthy => HealthStatus::Healthy,
            ReportedHealth::Warning => HealthStatus::Warning,
            ReportedHealth::Unhealthy => HealthStatus::Unhealthy,
        }
    }
}

/// Response body of a worker's health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ReportedHealth,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Self-description fetched from `{manifest_url}/manifest.json` when a
/// caller attaches their own compute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerManifest {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub task_kinds: Vec<String>,
    #[serde(default)]
    pub flags: Option<RoutingFlags>,
}

impl WorkerManifest {
    /// Materialize a descriptor for the worker this manifest describes.
    /// Manifest-attached workers always run on user compute.
    pub fn into_descriptor(self, id: WorkerId, endpoint: String) -> WorkerDescriptor {
        let mut flags = self.flags.unwrap_or_default();
        flags.runs_on_user_compute = true;
        WorkerDescriptor {
            id,
            name: self.name,
            endpoint,
            capabilities: self.capabilities,
            task_kinds: self.task_kinds,
            flags,
        }
    }
}
