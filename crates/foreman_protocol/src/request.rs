//! Caller-level work requests and their lifecycle.

use crate::capability::Capability;
use crate::error::ErrorKind;
use crate::ids::{RequestId, ResultId, WorkerId};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Request priority classes, dispatch order `Critical > High > Normal > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl RequestPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPriority::Low => "low",
            RequestPriority::Normal => "normal",
            RequestPriority::High => "high",
            RequestPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RequestPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RequestPriority::Low),
            "normal" => Ok(RequestPriority::Normal),
            "high" => Ok(RequestPriority::High),
            "critical" => Ok(RequestPriority::Critical),
            _ => Err(format!("Invalid priority: '{}'", s)),
        }
    }
}

/// Request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    #[default]
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Queued => "queued",
            RequestState::Running => "running",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Succeeded | RequestState::Failed | RequestState::Cancelled
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RequestState::Pending),
            "queued" => Ok(RequestState::Queued),
            "running" => Ok(RequestState::Running),
            "succeeded" => Ok(RequestState::Succeeded),
            "failed" => Ok(RequestState::Failed),
            "cancelled" | "canceled" => Ok(RequestState::Cancelled),
            _ => Err(format!("Invalid request state: '{}'", s)),
        }
    }
}

/// Opaque payload: bytes plus a content type.
///
/// The orchestrator never introspects payload contents beyond computing a
/// digest for envelope binding. Bytes serialize as base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Payload {
    #[serde(
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl Payload {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            bytes: value.to_string().into_bytes(),
            content_type: "application/json".to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Digest used to bind the payload into a signed envelope.
    pub fn digest(&self) -> String {
        crate::checksum::sha256_hex(&self.bytes)
    }
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// A caller-submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub owner: String,
    pub kind: String,
    #[serde(default)]
    pub priority: RequestPriority,
    pub payload: Payload,
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    #[serde(default)]
    pub heavy: bool,
    /// End-to-end deadline in seconds; the worker default applies when absent.
    pub deadline_secs: Option<u64>,
    pub max_attempts: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

/// Hard cap on retries regardless of what the caller asks for.
pub const MAX_ATTEMPTS_CEILING: u32 = 10;

impl Request {
    pub fn new(owner: impl Into<String>, kind: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: RequestId::new(),
            owner: owner.into(),
            kind: kind.into(),
            priority: RequestPriority::Normal,
            payload,
            required_capabilities: Vec::new(),
            heavy: false,
            deadline_secs: None,
            max_attempts: crate::defaults::DEFAULT_MAX_ATTEMPTS,
            metadata: HashMap::new(),
            state: RequestState::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, required: Vec<Capability>) -> Self {
        self.required_capabilities = required;
        self
    }

    pub fn with_heavy(mut self, heavy: bool) -> Self {
        self.heavy = heavy;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_secs = Some(deadline.as_secs());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.clamp(1, MAX_ATTEMPTS_CEILING);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Typed failure surfaced to the caller. Internal invariant details never
/// appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// Caller-visible view of a request's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatus {
    pub id: RequestId,
    pub state: RequestState,
    pub attempts_made: u32,
    pub last_worker_id: Option<WorkerId>,
    pub result_id: Option<ResultId>,
    pub error: Option<FailureInfo>,
}
