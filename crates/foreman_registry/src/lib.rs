//! Capability registry: the routable universe of workers.
//!
//! Owns worker descriptors, keeps task-kind and capability indices in
//! lockstep with registration, and caches health from a background probe
//! loop. All in-memory mutation happens under one write lock that is
//! never held across I/O; probes do their network call first and take
//! the lock only to record the outcome.

use chrono::Utc;
use foreman_protocol::{
    Capability, DispatchError, HealthStatus, WorkerDescriptor, WorkerHealth, WorkerId,
};
use foreman_transport::WorkerTransport;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Cadence of the background probe sweep.
    pub probe_interval: Duration,
    /// Cached health is fresh for this long.
    pub health_ttl: Duration,
    /// Budget for one health probe.
    pub probe_timeout: Duration,
    /// Minimum spacing between probes of the same worker.
    pub probe_min_spacing: Duration,
    /// Consecutive failures before a worker goes offline.
    pub offline_threshold: u32,
    /// Budget for a manifest fetch.
    pub manifest_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        use foreman_protocol::defaults::*;
        Self {
            probe_interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            health_ttl: Duration::from_secs(DEFAULT_HEALTH_TTL_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            probe_min_spacing: Duration::from_secs(DEFAULT_PROBE_MIN_SPACING_SECS),
            offline_threshold: DEFAULT_OFFLINE_THRESHOLD,
            manifest_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),
    #[error("manifest fetch failed: {0}")]
    Manifest(DispatchError),
}

/// A routable candidate handed to the router: descriptor plus the health
/// status it had at snapshot time.
#[derive(Debug, Clone)]
pub struct RoutableWorker {
    pub descriptor: WorkerDescriptor,
    pub status: HealthStatus,
}

/// Read-only registry surface. The router and job manager depend on this
/// trait, never on [`Registry`] itself.
pub trait RegistryReader: Send + Sync {
    fn get(&self, id: &WorkerId) -> Option<WorkerDescriptor>;
    fn health_snapshot(&self, id: &WorkerId) -> Option<WorkerHealth>;
    /// Enabled, Healthy/Warning workers declaring `kind`, ordered by
    /// health rank then flag priority.
    fn routable_for_kind(&self, kind: &str) -> Vec<RoutableWorker>;
    /// Live routability check used to re-validate cached route decisions.
    fn is_routable(&self, id: &WorkerId) -> bool;
}

struct WorkerEntry {
    descriptor: WorkerDescriptor,
    health: WorkerHealth,
    enabled: bool,
}

#[derive(Default)]
struct Indices {
    by_task_kind: HashMap<String, BTreeSet<WorkerId>>,
    by_capability_name: HashMap<String, BTreeSet<WorkerId>>,
    user_compute: BTreeSet<WorkerId>,
    operator_hosted: BTreeSet<WorkerId>,
}

impl Indices {
    fn insert(&mut self, descriptor: &WorkerDescriptor) {
        for kind in &descriptor.task_kinds {
            self.by_task_kind
                .entry(kind.clone())
                .or_default()
                .insert(descriptor.id.clone());
        }
        for cap in &descriptor.capabilities {
            self.by_capability_name
                .entry(cap.name.clone())
                .or_default()
                .insert(descriptor.id.clone());
        }
        if descriptor.flags.runs_on_user_compute {
            self.user_compute.insert(descriptor.id.clone());
        } else {
            self.operator_hosted.insert(descriptor.id.clone());
        }
    }

    fn remove(&mut self, descriptor: &WorkerDescriptor) {
        for kind in &descriptor.task_kinds {
            if let Some(set) = self.by_task_kind.get_mut(kind) {
                set.remove(&descriptor.id);
                if set.is_empty() {
                    self.by_task_kind.remove(kind);
                }
            }
        }
        for cap in &descriptor.capabilities {
            if let Some(set) = self.by_capability_name.get_mut(&cap.name) {
                set.remove(&descriptor.id);
                if set.is_empty() {
                    self.by_capability_name.remove(&cap.name);
                }
            }
        }
        self.user_compute.remove(&descriptor.id);
        self.operator_hosted.remove(&descriptor.id);
    }
}

#[derive(Default)]
struct Inner {
    workers: HashMap<WorkerId, WorkerEntry>,
    indices: Indices,
}

pub struct Registry {
    inner: RwLock<Inner>,
    transport: Arc<dyn WorkerTransport>,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(transport: Arc<dyn WorkerTransport>, config: RegistryConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            transport,
            config,
        }
    }

    /// Register a worker. Idempotent: re-registering the same id replaces
    /// the descriptor and rebuilds indices, but keeps accumulated health
    /// and the operator's enabled flag.
    pub fn register(&self, descriptor: WorkerDescriptor) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let (health, enabled) = match inner.workers.remove(&descriptor.id) {
            Some(existing) => {
                inner.indices.remove(&existing.descriptor);
                (existing.health, existing.enabled)
            }
            None => (WorkerHealth::default(), true),
        };
        info!(worker = %descriptor.id, kinds = descriptor.task_kinds.len(), "registering worker");
        inner.indices.insert(&descriptor);
        inner.workers.insert(
            descriptor.id.clone(),
            WorkerEntry {
                descriptor,
                health,
                enabled,
            },
        );
    }

    /// Remove a worker. Idempotent: deregistering an unknown id is a no-op.
    pub fn deregister(&self, id: &WorkerId) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(entry) = inner.workers.remove(id) {
            info!(worker = %id, "deregistering worker");
            inner.indices.remove(&entry.descriptor);
        }
    }

    /// Fetch a user-hosted worker's manifest and register the descriptor
    /// it describes. The manifest URL doubles as the worker endpoint.
    pub async fn register_from_manifest(
        &self,
        id: WorkerId,
        manifest_url: &str,
    ) -> Result<WorkerDescriptor, RegistryError> {
        let manifest = self
            .transport
            .fetch_manifest(manifest_url, self.config.manifest_timeout)
            .await
            .map_err(RegistryError::Manifest)?;
        let descriptor = manifest.into_descriptor(id, manifest_url.to_string());
        self.register(descriptor.clone());
        Ok(descriptor)
    }

    /// Operator kill switch. A disabled worker keeps its registration and
    /// health history but is never routable.
    pub fn set_enabled(&self, id: &WorkerId, enabled: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner
            .workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.clone()))?;
        entry.enabled = enabled;
        info!(worker = %id, enabled, "worker enabled flag changed");
        Ok(())
    }

    /// Workers declaring `kind`, regardless of health, ordered like
    /// [`RegistryReader::routable_for_kind`].
    pub fn lookup_by_task_kind(&self, kind: &str) -> Vec<WorkerDescriptor> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let Some(ids) = inner.indices.by_task_kind.get(kind) else {
            return Vec::new();
        };
        let mut entries: Vec<&WorkerEntry> = ids
            .iter()
            .filter_map(|id| inner.workers.get(id))
            .collect();
        sort_by_rank(&mut entries);
        entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    /// Workers whose declared set satisfies `required`.
    pub fn lookup_by_capability(&self, required: &Capability) -> Vec<WorkerDescriptor> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let Some(ids) = inner.indices.by_capability_name.get(&required.name) else {
            return Vec::new();
        };
        let mut entries: Vec<&WorkerEntry> = ids
            .iter()
            .filter_map(|id| inner.workers.get(id))
            .filter(|e| e.descriptor.satisfies(required))
            .collect();
        sort_by_rank(&mut entries);
        entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    /// All registered workers with their health, for operator listings.
    pub fn list(&self) -> Vec<(WorkerDescriptor, WorkerHealth, bool)> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut all: Vec<_> = inner
            .workers
            .values()
            .map(|e| (e.descriptor.clone(), e.health.clone(), e.enabled))
            .collect();
        all.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        all
    }

    /// Cached health honoring the freshness contract: fresh values are
    /// returned as-is, values between one and two TTLs old are degraded
    /// to Warning, anything older forces a probe.
    pub async fn health_of(&self, id: &WorkerId) -> Result<HealthStatus, RegistryError> {
        let (status, age) = {
            let inner = self.inner.read().expect("registry lock poisoned");
            let entry = inner
                .workers
                .get(id)
                .ok_or_else(|| RegistryError::UnknownWorker(id.clone()))?;
            let age = entry
                .health
                .last_probe_at
                .map(|at| (Utc::now() - at).to_std().unwrap_or(Duration::ZERO));
            (entry.health.status, age)
        };

        match age {
            Some(age) if age <= self.config.health_ttl => Ok(status),
            Some(age) if age <= self.config.health_ttl * 2 => {
                // Bounded-stale: usable, but never better than Warning.
                Ok(match status {
                    HealthStatus::Healthy => HealthStatus::Warning,
                    other => other,
                })
            }
            _ => self.probe(id).await,
        }
    }

    /// Probe a worker's health endpoint and record the outcome.
    pub async fn probe(&self, id: &WorkerId) -> Result<HealthStatus, RegistryError> {
        let descriptor = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.clone()))?;

        let outcome = self
            .transport
            .fetch_health(&descriptor, self.config.probe_timeout)
            .await;
        let now = Utc::now();

        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner
            .workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.clone()))?;
        match outcome {
            Ok(report) => {
                let status = HealthStatus::from(report.status);
                entry.health.record_success(status, now);
                debug!(worker = %id, %status, "probe succeeded");
            }
            Err(e) => {
                entry
                    .health
                    .record_failure(e.to_string(), now, self.config.offline_threshold);
                warn!(worker = %id, error = %e, streak = entry.health.consecutive_failures, "probe failed");
            }
        }
        Ok(entry.health.status)
    }

    /// Probe every worker not probed within the minimum spacing window.
    pub async fn probe_all(&self) {
        let now = Utc::now();
        let due: Vec<WorkerId> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .workers
                .values()
                .filter(|entry| match entry.health.last_probe_at {
                    Some(at) => {
                        (now - at).to_std().unwrap_or(Duration::ZERO)
                            >= self.config.probe_min_spacing
                    }
                    None => true,
                })
                .map(|entry| entry.descriptor.id.clone())
                .collect()
        };
        for id in due {
            // Worker may have been deregistered mid-sweep; that is fine.
            let _ = self.probe(&id).await;
        }
    }

    /// Background sweep at `probe_interval` until `shutdown` flips true.
    pub async fn run_probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("probe loop stopping");
                        return;
                    }
                }
            }
        }
    }
}

impl RegistryReader for Registry {
    fn get(&self, id: &WorkerId) -> Option<WorkerDescriptor> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.workers.get(id).map(|e| e.descriptor.clone())
    }

    fn health_snapshot(&self, id: &WorkerId) -> Option<WorkerHealth> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.workers.get(id).map(|e| e.health.clone())
    }

    fn routable_for_kind(&self, kind: &str) -> Vec<RoutableWorker> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let Some(ids) = inner.indices.by_task_kind.get(kind) else {
            return Vec::new();
        };
        let mut entries: Vec<&WorkerEntry> = ids
            .iter()
            .filter_map(|id| inner.workers.get(id))
            .filter(|e| e.enabled && e.health.status.is_routable())
            .collect();
        sort_by_rank(&mut entries);
        entries
            .iter()
            .map(|e| RoutableWorker {
                descriptor: e.descriptor.clone(),
                status: e.health.status,
            })
            .collect()
    }

    fn is_routable(&self, id: &WorkerId) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .workers
            .get(id)
            .map(|e| e.enabled && e.health.status.is_routable())
            .unwrap_or(false)
    }
}

fn health_rank(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Warning => 1,
        HealthStatus::Unhealthy => 2,
        HealthStatus::Unknown => 3,
        HealthStatus::Offline => 4,
    }
}

fn sort_by_rank(entries: &mut [&WorkerEntry]) {
    entries.sort_by(|a, b| {
        health_rank(a.health.status)
            .cmp(&health_rank(b.health.status))
            .then(b.descriptor.flags.priority.cmp(&a.descriptor.flags.priority))
            .then(a.descriptor.id.cmp(&b.descriptor.id))
    });
}
