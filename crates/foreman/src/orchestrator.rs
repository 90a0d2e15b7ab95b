//! Orchestrator facade: wires registry, router, store, and dispatch
//! together and owns the background loops.

use anyhow::{bail, Context, Result};
use foreman_dispatch::{DispatchConfig, InFlightTracker, JobManager, MetricsSnapshot};
use foreman_envelope::{EnvelopeSigner, EnvelopeVerifier};
use foreman_protocol::config::SystemConfig;
use foreman_protocol::wire::CallbackPayload;
use foreman_protocol::{
    defaults, OrchestratorError, Request, RequestId, RequestStatus, ResultId, StoreError,
    StoredResult, WorkerDescriptor, WorkerHealth, WorkerId,
};
use foreman_registry::{Registry, RegistryConfig, RegistryError};
use foreman_router::{RouteDecision, Router, RouterConfig};
use foreman_state::StateStore;
use foreman_store::{BlobBackend, FsBlobBackend, MemoryBlobBackend, ResultStore, StoreConfig};
use foreman_transport::HttpTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Orchestrator {
    registry: Arc<Registry>,
    router: Arc<Router>,
    manager: Arc<JobManager>,
    results: Arc<ResultStore>,
    state: Arc<dyn StateStore>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Boot the control plane: load keys and persisted workers, seed the
    /// fleet, probe it, recover interrupted jobs, start the loops.
    pub async fn start(config: SystemConfig) -> Result<Self> {
        let envelope_ttl = Duration::from_secs(defaults::DEFAULT_ENVELOPE_TTL_SECS);
        let clock_skew = Duration::from_secs(defaults::DEFAULT_CLOCK_SKEW_SECS);

        let Some(signing_key_path) = &config.signing_key_path else {
            bail!("a signing key is required (--signing-key)");
        };
        let signing_pem = std::fs::read(signing_key_path).with_context(|| {
            format!("Failed to read signing key: {}", signing_key_path.display())
        })?;
        let signer = Arc::new(
            EnvelopeSigner::from_pem(&signing_pem, &config.issuer, envelope_ttl)
                .context("Failed to load signing key")?,
        );

        if config.verify_key_paths.is_empty() {
            bail!("at least one verification key is required (--verify-key)");
        }
        let mut verify_pems = Vec::with_capacity(config.verify_key_paths.len());
        for path in &config.verify_key_paths {
            verify_pems.push(
                std::fs::read(path)
                    .with_context(|| format!("Failed to read verify key: {}", path.display()))?,
            );
        }
        let verifier = Arc::new(
            EnvelopeVerifier::from_pems(&verify_pems, envelope_ttl, clock_skew)
                .context("Failed to load verification keys")?
                .with_issuer(&config.issuer),
        );

        let state = foreman_state::open(&config.state_url)
            .await
            .context("Failed to open state store")?;

        let transport = Arc::new(HttpTransport::new());
        let registry = Arc::new(Registry::new(transport.clone(), RegistryConfig::default()));

        // Workers known from a previous life come back first, then the
        // fleet file (which may overwrite them with fresher descriptors).
        for descriptor in state.load_workers().await.map_err(anyhow::Error::from)? {
            registry.register(descriptor);
        }
        if let Some(fleet_path) = &config.fleet_path {
            for descriptor in crate::fleet::load_fleet(fleet_path)? {
                state
                    .upsert_worker(&descriptor)
                    .await
                    .map_err(anyhow::Error::from)?;
                registry.register(descriptor);
            }
        }
        registry.probe_all().await;

        let blobs: Arc<dyn BlobBackend> = match &config.blob_root {
            Some(root) => Arc::new(FsBlobBackend::new(root.clone())),
            None => Arc::new(MemoryBlobBackend::new()),
        };
        let results = Arc::new(ResultStore::new(
            state.clone(),
            blobs,
            StoreConfig::default(),
        ));

        let in_flight = Arc::new(InFlightTracker::new());
        let router = Arc::new(Router::new(
            registry.clone(),
            in_flight.clone(),
            RouterConfig::default(),
        ));

        let dispatch_config = DispatchConfig {
            callback_url: config.callback_url.clone(),
            ..DispatchConfig::default()
        };
        let manager = Arc::new(JobManager::new(
            registry.clone(),
            router.clone(),
            signer,
            verifier,
            transport,
            results.clone(),
            state.clone(),
            in_flight,
            dispatch_config,
        ));

        let recovered = manager.recover().await?;
        if recovered > 0 {
            info!(recovered, "re-enqueued interrupted jobs");
        }

        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(manager.clone().run_dispatcher(rx.clone())),
            tokio::spawn(registry.clone().run_probe_loop(rx.clone())),
            tokio::spawn(results.clone().run_retention_loop(rx)),
        ];

        info!(workers = registry.list().len(), "orchestrator started");
        Ok(Self {
            registry,
            router,
            manager,
            results,
            state,
            shutdown,
            tasks,
        })
    }

    // Request lifecycle -----------------------------------------------------

    pub async fn submit(&self, request: Request) -> Result<RequestStatus, OrchestratorError> {
        self.manager.submit(request).await
    }

    pub fn status(&self, request_id: &RequestId) -> Option<RequestStatus> {
        self.manager.status(request_id)
    }

    pub async fn cancel(&self, request_id: &RequestId) -> bool {
        self.manager.cancel(request_id).await
    }

    pub async fn handle_callback(&self, callback: CallbackPayload) -> Result<(), OrchestratorError> {
        self.manager.handle_callback(callback).await
    }

    // Results ---------------------------------------------------------------

    pub async fn result(&self, owner: &str, result_id: &ResultId) -> Result<StoredResult, StoreError> {
        self.results.get(owner, result_id).await
    }

    pub async fn result_bytes(&self, result: &StoredResult) -> Result<Vec<u8>, StoreError> {
        self.results.resolve_bytes(result).await
    }

    pub async fn list_results(
        &self,
        owner: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<StoredResult>, Option<String>), StoreError> {
        self.results.list_by_owner(owner, cursor, limit).await
    }

    // Worker administration -------------------------------------------------

    pub async fn register_worker(&self, descriptor: WorkerDescriptor) -> Result<()> {
        self.state
            .upsert_worker(&descriptor)
            .await
            .map_err(anyhow::Error::from)?;
        self.registry.register(descriptor);
        Ok(())
    }

    pub async fn deregister_worker(&self, id: &WorkerId) -> Result<()> {
        self.registry.deregister(id);
        self.state
            .remove_worker(id)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// Attach caller-owned compute by manifest URL.
    pub async fn attach_user_worker(
        &self,
        id: WorkerId,
        manifest_url: &str,
    ) -> Result<WorkerDescriptor> {
        let descriptor = self
            .registry
            .register_from_manifest(id, manifest_url)
            .await
            .map_err(anyhow::Error::from)?;
        self.state
            .upsert_worker(&descriptor)
            .await
            .map_err(anyhow::Error::from)?;
        let _ = self.registry.probe(&descriptor.id).await;
        Ok(descriptor)
    }

    pub fn set_worker_enabled(&self, id: &WorkerId, enabled: bool) -> Result<(), RegistryError> {
        self.registry.set_enabled(id, enabled)
    }

    pub async fn force_probe(&self, id: &WorkerId) -> Result<(), RegistryError> {
        self.registry.probe(id).await.map(|_| ())
    }

    pub fn list_workers(&self) -> Vec<(WorkerDescriptor, WorkerHealth, bool)> {
        self.registry.list()
    }

    // Operator controls -----------------------------------------------------

    pub fn drain(&self, draining: bool) {
        self.manager.set_draining(draining);
    }

    pub fn flush_route_cache(&self) {
        self.router.flush_cache();
    }

    pub fn recent_decisions(&self, limit: usize) -> Vec<RouteDecision> {
        self.router.recent_decisions(limit)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.manager.metrics()
    }

    /// Stop the loops and wait for them to land.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("orchestrator stopped");
    }
}
