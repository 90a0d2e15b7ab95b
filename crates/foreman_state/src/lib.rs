//! Control-plane persistence.
//!
//! The orchestrator treats storage as a semantic interface over five
//! entities: workers, requests, jobs, results, and routing-decision audit
//! entries. Deployments choose a backend by URL: `memory:` keeps
//! everything in process (in-flight state dies with the process), and
//! `sqlite:<path>` persists it so interrupted jobs can be recovered at
//! the next boot.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_protocol::{
    Job, JobId, Request, RequestId, ResultId, StoredResult, WorkerDescriptor, WorkerId,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state backend failure: {0}")]
    Backend(String),
    #[error("unsupported state store URL: {0}")]
    UnsupportedUrl(String),
}

impl From<sqlx::Error> for StateError {
    fn from(e: sqlx::Error) -> Self {
        StateError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Backend(e.to_string())
    }
}

/// Parsed state store URL.
#[derive(Debug, Clone)]
pub enum StateUrl {
    Memory,
    Sqlite(PathBuf),
}

impl StateUrl {
    pub fn parse(raw: &str) -> Result<Self, StateError> {
        if raw == "memory:" || raw == "memory" {
            return Ok(Self::Memory);
        }
        if let Some(rest) = raw.strip_prefix("sqlite:") {
            let path = rest.trim();
            if path.is_empty() {
                return Err(StateError::UnsupportedUrl(format!(
                    "sqlite URL missing path: {raw}"
                )));
            }
            return Ok(Self::Sqlite(PathBuf::from(path)));
        }
        Err(StateError::UnsupportedUrl(raw.to_string()))
    }
}

/// Audit entry for one routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecisionRecord {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub total_score: f64,
    /// Serialized score breakdown, opaque to storage.
    pub breakdown_json: String,
    pub decided_at: DateTime<Utc>,
}

/// Semantic persistence interface for the orchestrator.
///
/// Entities are upserted whole; all reads return owned copies. Requests
/// and jobs are append-mostly: after a terminal state is written the
/// caller never updates them again.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Workers
    async fn upsert_worker(&self, descriptor: &WorkerDescriptor) -> Result<(), StateError>;
    async fn remove_worker(&self, id: &WorkerId) -> Result<(), StateError>;
    async fn load_workers(&self) -> Result<Vec<WorkerDescriptor>, StateError>;

    // Requests
    async fn upsert_request(&self, request: &Request) -> Result<(), StateError>;
    async fn get_request(&self, id: &RequestId) -> Result<Option<Request>, StateError>;

    // Jobs
    async fn upsert_job(&self, job: &Job) -> Result<(), StateError>;
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StateError>;
    async fn jobs_for_request(&self, request_id: &RequestId) -> Result<Vec<Job>, StateError>;
    /// Jobs still queued or running; the recovery path re-enqueues these.
    async fn active_jobs(&self) -> Result<Vec<Job>, StateError>;

    // Results
    async fn put_result(&self, result: &StoredResult) -> Result<(), StateError>;
    async fn get_result(
        &self,
        owner: &str,
        id: &ResultId,
    ) -> Result<Option<StoredResult>, StateError>;
    /// Returns true when a record was actually removed.
    async fn delete_result(&self, owner: &str, id: &ResultId) -> Result<bool, StateError>;
    /// Newest first.
    async fn list_results(
        &self,
        owner: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredResult>, StateError>;
    /// Remove results created before `cutoff`; returns what was removed
    /// so pointer blobs can be cleaned up too.
    async fn expire_results(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredResult>, StateError>;

    // Routing audit
    async fn append_decision(&self, record: &RouteDecisionRecord) -> Result<(), StateError>;
    async fn recent_decisions(&self, limit: usize) -> Result<Vec<RouteDecisionRecord>, StateError>;
}

/// Open a state store by URL.
pub async fn open(url: &str) -> Result<Arc<dyn StateStore>, StateError> {
    match StateUrl::parse(url)? {
        StateUrl::Memory => Ok(Arc::new(MemoryStateStore::new())),
        StateUrl::Sqlite(path) => Ok(Arc::new(SqliteStateStore::open(&path).await?)),
    }
}
