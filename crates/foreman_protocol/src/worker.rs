//! Worker descriptors and health bookkeeping.

use crate::capability::Capability;
use crate::ids::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Worker health status.
///
/// This is the CANONICAL definition - routing, probing, and scoring all
/// use this enum. A worker is routable iff Healthy or Warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
    #[default]
    Unknown,
    Offline,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Offline => "offline",
        }
    }

    pub fn is_routable(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Warning)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "healthy" => Ok(HealthStatus::Healthy),
            "warning" => Ok(HealthStatus::Warning),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            "unknown" => Ok(HealthStatus::Unknown),
            "offline" => Ok(HealthStatus::Offline),
            _ => Err(format!("Invalid health status: '{}'", s)),
        }
    }
}

/// Routing flags attached to a worker at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingFlags {
    /// Worker lives on caller-owned compute (attached via manifest).
    #[serde(default)]
    pub runs_on_user_compute: bool,
    /// Worker produces large artifacts and asks for pointer storage.
    #[serde(default)]
    pub prefers_pointer_result: bool,
    /// Operator-hosted fleet may pick up this worker's kinds as fallback.
    #[serde(default = "default_true")]
    pub allow_operator_fallback: bool,
    /// Tie-break priority; higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Concurrent jobs this worker will accept.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    /// Per-job deadline applied when the request does not carry one, seconds.
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> u32 {
    crate::defaults::DEFAULT_WORKER_MAX_IN_FLIGHT
}

fn default_deadline_secs() -> u64 {
    crate::defaults::DEFAULT_JOB_DEADLINE_SECS
}

impl Default for RoutingFlags {
    fn default() -> Self {
        Self {
            runs_on_user_compute: false,
            prefers_pointer_result: false,
            allow_operator_fallback: true,
            priority: 0,
            max_in_flight: default_max_in_flight(),
            default_deadline_secs: default_deadline_secs(),
        }
    }
}

impl RoutingFlags {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }
}

/// Immutable worker identity plus declared abilities.
///
/// Health lives separately in [`WorkerHealth`]; descriptors never change
/// after registration, they are only replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    pub name: String,
    /// Execute/health base URL, or the manifest URL it was attached from.
    pub endpoint: String,
    pub capabilities: Vec<Capability>,
    pub task_kinds: Vec<String>,
    #[serde(default)]
    pub flags: RoutingFlags,
}

impl WorkerDescriptor {
    pub fn supports_kind(&self, kind: &str) -> bool {
        self.task_kinds.iter().any(|k| k == kind)
    }

    /// True when some declared capability satisfies `required`.
    pub fn satisfies(&self, required: &Capability) -> bool {
        self.capabilities.iter().any(|cap| cap.satisfies(required))
    }
}

/// Mutable health record maintained by the probe loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkerHealth {
    pub status: HealthStatus,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub probes_total: u64,
    pub probes_failed: u64,
}

impl WorkerHealth {
    /// Apply a successful probe result. Any success resets the failure streak.
    pub fn record_success(&mut self, status: HealthStatus, at: DateTime<Utc>) {
        self.status = status;
        self.last_probe_at = Some(at);
        self.last_error = None;
        self.consecutive_failures = 0;
        self.probes_total += 1;
    }

    /// Apply a failed probe. `offline_threshold` consecutive failures flip
    /// the worker to Offline.
    pub fn record_failure(&mut self, error: String, at: DateTime<Utc>, offline_threshold: u32) {
        self.last_probe_at = Some(at);
        self.last_error = Some(error);
        self.consecutive_failures += 1;
        self.probes_total += 1;
        self.probes_failed += 1;
        if self.consecutive_failures >= offline_threshold {
            self.status = HealthStatus::Offline;
        } else {
            self.status = HealthStatus::Unhealthy;
        }
    }
}
