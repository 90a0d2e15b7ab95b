//! In-memory state store, the default backend.
//!
//! Nothing survives a restart; non-durable deployments accept that
//! in-flight jobs are lost and surface that to callers.

use crate::{RouteDecisionRecord, StateError, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_protocol::{
    Job, JobId, Request, RequestId, ResultId, StoredResult, WorkerDescriptor, WorkerId,
};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    workers: HashMap<WorkerId, WorkerDescriptor>,
    requests: HashMap<RequestId, Request>,
    jobs: HashMap<JobId, Job>,
    results: HashMap<(String, ResultId), StoredResult>,
    decisions: Vec<RouteDecisionRecord>,
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn upsert_worker(&self, descriptor: &WorkerDescriptor) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner
            .workers
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(())
    }

    async fn remove_worker(&self, id: &WorkerId) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.workers.remove(id);
        Ok(())
    }

    async fn load_workers(&self) -> Result<Vec<WorkerDescriptor>, StateError> {
        let inner = self.inner.lock().expect("state lock poisoned");
        let mut workers: Vec<_> = inner.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn upsert_request(&self, request: &Request) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<Request>, StateError> {
        let inner = self.inner.lock().expect("state lock poisoned");
        Ok(inner.requests.get(id).cloned())
    }

    async fn upsert_job(&self, job: &Job) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StateError> {
        let inner = self.inner.lock().expect("state lock poisoned");
        Ok(inner.jobs.get(id).cloned())
    }

    async fn jobs_for_request(&self, request_id: &RequestId) -> Result<Vec<Job>, StateError> {
        let inner = self.inner.lock().expect("state lock poisoned");
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| &job.request_id == request_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.attempt);
        Ok(jobs)
    }

    async fn active_jobs(&self) -> Result<Vec<Job>, StateError> {
        let inner = self.inner.lock().expect("state lock poisoned");
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn put_result(&self, result: &StoredResult) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner
            .results
            .insert((result.owner.clone(), result.id.clone()), result.clone());
        Ok(())
    }

    async fn get_result(
        &self,
        owner: &str,
        id: &ResultId,
    ) -> Result<Option<StoredResult>, StateError> {
        let inner = self.inner.lock().expect("state lock poisoned");
        Ok(inner.results.get(&(owner.to_string(), id.clone())).cloned())
    }

    async fn delete_result(&self, owner: &str, id: &ResultId) -> Result<bool, StateError> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        Ok(inner
            .results
            .remove(&(owner.to_string(), id.clone()))
            .is_some())
    }

    async fn list_results(
        &self,
        owner: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredResult>, StateError> {
        let inner = self.inner.lock().expect("state lock poisoned");
        let mut results: Vec<_> = inner
            .results
            .values()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn expire_results(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StoredResult>, StateError> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        let expired_keys: Vec<(String, ResultId)> = inner
            .results
            .iter()
            .filter(|(_, r)| r.created_at < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        let mut expired = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(result) = inner.results.remove(&key) {
                expired.push(result);
            }
        }
        Ok(expired)
    }

    async fn append_decision(&self, record: &RouteDecisionRecord) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        inner.decisions.push(record.clone());
        Ok(())
    }

    async fn recent_decisions(
        &self,
        limit: usize,
    ) -> Result<Vec<RouteDecisionRecord>, StateError> {
        let inner = self.inner.lock().expect("state lock poisoned");
        let start = inner.decisions.len().saturating_sub(limit);
        Ok(inner.decisions[start..].to_vec())
    }
}
