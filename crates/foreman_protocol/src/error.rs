//! Typed error taxonomy for the orchestrator core.
//!
//! Every failure that crosses a component boundary is one of these
//! enums; nothing stringly-typed drives control flow.

use crate::ids::WorkerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Envelope signing/verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("signing key is not configured")]
    NoSigningKey,
    #[error("envelope signature is invalid")]
    BadSignature,
    #[error("envelope has expired")]
    Expired,
    #[error("envelope is malformed: {0}")]
    Malformed(String),
    #[error("envelope was issued for a different audience")]
    WrongAudience,
}

/// Transport-level dispatch failures, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("dispatch timed out")]
    Timeout,
    #[error("worker returned HTTP {0}")]
    Http4xx(u16),
    #[error("worker returned HTTP {0}")]
    Http5xx(u16),
    #[error("worker rejected the envelope")]
    EnvelopeRejected,
    #[error("worker response was malformed: {0}")]
    MalformedResponse(String),
}

impl DispatchError {
    /// Retriable per the job manager's policy: network trouble, timeouts,
    /// server errors, and the three try-again 4xx codes (408/425/429).
    pub fn is_retriable(&self) -> bool {
        match self {
            DispatchError::Network(_) | DispatchError::Timeout | DispatchError::Http5xx(_) => true,
            DispatchError::Http4xx(status) => matches!(status, 408 | 425 | 429),
            DispatchError::EnvelopeRejected | DispatchError::MalformedResponse(_) => false,
        }
    }
}

/// Result store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("result not found")]
    NotFound,
    #[error("blob backend failure: {0}")]
    Blob(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Top-level orchestrator error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("no worker available for this request")]
    NoWorkerAvailable,
    #[error("envelope invalid: {0}")]
    EnvelopeInvalid(#[from] EnvelopeError),
    #[error("dispatch failed: {0}")]
    DispatchFailed(#[from] DispatchError),
    #[error("job exceeded its deadline")]
    JobTimeout,
    #[error("job was cancelled")]
    JobCancelled,
    #[error("worker {0} became unhealthy during dispatch")]
    WorkerUnhealthy(WorkerId),
    #[error("worker declined: capability version or parameters did not match")]
    CapabilityMismatch,
    #[error("result store failure: {0}")]
    StorageFailure(String),
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NoWorkerAvailable => ErrorKind::NoWorkerAvailable,
            OrchestratorError::EnvelopeInvalid(_) => ErrorKind::EnvelopeInvalid,
            OrchestratorError::DispatchFailed(_) => ErrorKind::DispatchFailed,
            OrchestratorError::JobTimeout => ErrorKind::JobTimeout,
            OrchestratorError::JobCancelled => ErrorKind::JobCancelled,
            OrchestratorError::WorkerUnhealthy(_) => ErrorKind::WorkerUnhealthy,
            OrchestratorError::CapabilityMismatch => ErrorKind::CapabilityMismatch,
            OrchestratorError::StorageFailure(_) => ErrorKind::StorageFailure,
            OrchestratorError::InternalInvariant(_) => ErrorKind::InternalInvariant,
        }
    }

    /// Whether the retry policy may re-enqueue after this failure.
    pub fn is_retriable(&self) -> bool {
        match self {
            OrchestratorError::DispatchFailed(e) => e.is_retriable(),
            OrchestratorError::JobTimeout | OrchestratorError::WorkerUnhealthy(_) => true,
            _ => false,
        }
    }
}

/// Field-free mirror of the taxonomy, safe to surface to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoWorkerAvailable,
    EnvelopeInvalid,
    DispatchFailed,
    JobTimeout,
    JobCancelled,
    WorkerUnhealthy,
    CapabilityMismatch,
    StorageFailure,
    InternalInvariant,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoWorkerAvailable => "no_worker_available",
            ErrorKind::EnvelopeInvalid => "envelope_invalid",
            ErrorKind::DispatchFailed => "dispatch_failed",
            ErrorKind::JobTimeout => "job_timeout",
            ErrorKind::JobCancelled => "job_cancelled",
            ErrorKind::WorkerUnhealthy => "worker_unhealthy",
            ErrorKind::CapabilityMismatch => "capability_mismatch",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::InternalInvariant => "internal_invariant",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_dispatch_errors() {
        assert!(DispatchError::Network("reset".into()).is_retriable());
        assert!(DispatchError::Timeout.is_retriable());
        assert!(DispatchError::Http5xx(503).is_retriable());
        assert!(DispatchError::Http4xx(429).is_retriable());
        assert!(DispatchError::Http4xx(408).is_retriable());
        assert!(DispatchError::Http4xx(425).is_retriable());
    }

    #[test]
    fn test_non_retriable_dispatch_errors() {
        assert!(!DispatchError::Http4xx(400).is_retriable());
        assert!(!DispatchError::Http4xx(401).is_retriable());
        assert!(!DispatchError::EnvelopeRejected.is_retriable());
        assert!(!DispatchError::MalformedResponse("bad json".into()).is_retriable());
    }

    #[test]
    fn test_orchestrator_retriability() {
        assert!(OrchestratorError::JobTimeout.is_retriable());
        assert!(OrchestratorError::WorkerUnhealthy(WorkerId::from("w1")).is_retriable());
        assert!(!OrchestratorError::NoWorkerAvailable.is_retriable());
        assert!(!OrchestratorError::JobCancelled.is_retriable());
        assert!(!OrchestratorError::CapabilityMismatch.is_retriable());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            OrchestratorError::JobTimeout.kind().as_str(),
            "job_timeout"
        );
        assert_eq!(
            OrchestratorError::EnvelopeInvalid(EnvelopeError::Expired).kind(),
            ErrorKind::EnvelopeInvalid
        );
    }
}
