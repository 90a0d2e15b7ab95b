//! Task router: pick exactly one worker for a request.
//!
//! Candidates come from the registry, get a four-factor weighted score,
//! and the best one wins. Ties break on current in-flight load, then the
//! worker's priority flag, then a pseudo-random pick seeded on the
//! request id so equal inputs route identically. Decisions are memoized
//! in a short-TTL cache (re-validated against live health) and recorded
//! in a bounded ring for introspection.

use chrono::{DateTime, Utc};
use foreman_protocol::capability::fingerprint;
use foreman_protocol::{
    HealthStatus, OrchestratorError, Request, RequestId, RequestPriority, WorkerDescriptor,
    WorkerId,
};
use foreman_registry::{RegistryReader, RoutableWorker};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const SCORE_EPSILON: f64 = 1e-9;

/// Router tunables. Weights sum to 1.0.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub capability_weight: f64,
    pub resource_weight: f64,
    pub health_weight: f64,
    pub preference_weight: f64,
    /// Candidates scoring below the floor are dropped.
    pub score_floor: f64,
    /// Per-priority floor overrides; deployments that refuse to put
    /// critical work on degraded workers raise the Critical entry.
    pub priority_floors: HashMap<RequestPriority, f64>,
    /// When set, heavy requests only route to user-compute workers.
    pub gate_heavy_to_user_compute: bool,
    /// Resource score for a light request on a user-compute worker.
    pub light_on_user_compute_penalty: f64,
    pub cache_ttl: Duration,
    pub decision_ring_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        use foreman_protocol::defaults::*;
        Self {
            capability_weight: 0.40,
            resource_weight: 0.30,
            health_weight: 0.20,
            preference_weight: 0.10,
            score_floor: DEFAULT_SCORE_FLOOR,
            priority_floors: HashMap::new(),
            gate_heavy_to_user_compute: true,
            light_on_user_compute_penalty: 0.5,
            cache_ttl: Duration::from_secs(DEFAULT_ROUTE_CACHE_TTL_SECS),
            decision_ring_capacity: DEFAULT_DECISION_RING_CAPACITY,
        }
    }
}

impl RouterConfig {
    fn floor_for(&self, priority: RequestPriority) -> f64 {
        self.priority_floors
            .get(&priority)
            .copied()
            .unwrap_or(self.score_floor)
    }
}

/// Per-worker in-flight counts, provided by the job manager.
pub trait WorkerLoad: Send + Sync {
    fn in_flight(&self, id: &WorkerId) -> u32;
}

/// Load source for deployments without a job manager attached (tests,
/// dry-run tooling): every worker reads as idle.
pub struct NoLoad;

impl WorkerLoad for NoLoad {
    fn in_flight(&self, _id: &WorkerId) -> u32 {
        0
    }
}

/// Normalized sub-scores and their weighted total.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScoreBreakdown {
    pub capability: f64,
    pub resource: f64,
    pub health: f64,
    pub preference: f64,
    pub total: f64,
}

/// One routing decision, kept in the introspection ring.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub request_id: RequestId,
    pub kind: String,
    pub worker_id: WorkerId,
    pub breakdown: ScoreBreakdown,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: String,
    heavy: bool,
    owner: String,
    capability_fingerprint: String,
}

struct CachedRoute {
    worker_id: WorkerId,
    cached_at: Instant,
}

pub struct Router {
    registry: Arc<dyn RegistryReader>,
    load: Arc<dyn WorkerLoad>,
    config: RouterConfig,
    cache: Mutex<HashMap<CacheKey, CachedRoute>>,
    decisions: Mutex<VecDeque<RouteDecision>>,
}

impl Router {
    pub fn new(
        registry: Arc<dyn RegistryReader>,
        load: Arc<dyn WorkerLoad>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            load,
            config,
            cache: Mutex::new(HashMap::new()),
            decisions: Mutex::new(VecDeque::new()),
        }
    }

    /// Pick the worker for `request`.
    pub fn route(&self, request: &Request) -> Result<WorkerDescriptor, OrchestratorError> {
        self.route_full(request).map(|(descriptor, _)| descriptor)
    }

    /// Like [`Router::route`], but also returns the freshly made decision
    /// so callers can persist it. Cache hits return `None`: their decision
    /// was recorded when it was first made.
    pub fn route_full(
        &self,
        request: &Request,
    ) -> Result<(WorkerDescriptor, Option<RouteDecision>), OrchestratorError> {
        let key = CacheKey {
            kind: request.kind.clone(),
            heavy: request.heavy,
            owner: request.owner.clone(),
            capability_fingerprint: fingerprint(&request.required_capabilities),
        };

        // A cache hit is only a hint: the worker must still be routable
        // right now, otherwise the entry is dropped and we re-score.
        if let Some(worker_id) = self.cached_route(&key) {
            if self.registry.is_routable(&worker_id) {
                if let Some(descriptor) = self.registry.get(&worker_id) {
                    debug!(request = %request.id, worker = %worker_id, "route cache hit");
                    return Ok((descriptor, None));
                }
            }
            self.cache.lock().expect("route cache lock poisoned").remove(&key);
        }

        let candidates = self.registry.routable_for_kind(&request.kind);
        if candidates.is_empty() {
            return Err(OrchestratorError::NoWorkerAvailable);
        }

        let scored: Vec<(RoutableWorker, ScoreBreakdown)> = candidates
            .into_iter()
            .filter_map(|candidate| {
                let breakdown = self.score(request, &candidate);
                breakdown.map(|b| (candidate, b))
            })
            .collect();

        let floor = self.config.floor_for(request.priority);
        let survivors: Vec<&(RoutableWorker, ScoreBreakdown)> = scored
            .iter()
            .filter(|(_, b)| b.total >= floor)
            .collect();
        if survivors.is_empty() {
            return Err(OrchestratorError::NoWorkerAvailable);
        }

        let chosen = self.break_ties(&request.id, survivors);
        let decision = RouteDecision {
            request_id: request.id.clone(),
            kind: request.kind.clone(),
            worker_id: chosen.0.descriptor.id.clone(),
            breakdown: chosen.1,
            decided_at: Utc::now(),
        };
        debug!(
            request = %decision.request_id,
            worker = %decision.worker_id,
            total = decision.breakdown.total,
            "routed request"
        );
        self.record_decision(decision.clone());

        let mut cache = self.cache.lock().expect("route cache lock poisoned");
        cache.insert(
            key,
            CachedRoute {
                worker_id: chosen.0.descriptor.id.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok((chosen.0.descriptor.clone(), Some(decision)))
    }

    /// Score one candidate; `None` means ineligible: a non-empty
    /// requirement set the worker satisfies not at all, or a zero
    /// resource fit (unsupported kind, or heavy work in a deployment
    /// that gates it to user compute).
    fn score(&self, request: &Request, candidate: &RoutableWorker) -> Option<ScoreBreakdown> {
        let capability = capability_score(request, &candidate.descriptor);
        if !request.required_capabilities.is_empty() && capability == 0.0 {
            return None;
        }
        let resource = self.resource_score(request, &candidate.descriptor);
        if resource == 0.0 {
            return None;
        }
        let health = health_score(candidate.status);
        let preference = 1.0;

        let total = capability * self.config.capability_weight
            + resource * self.config.resource_weight
            + health * self.config.health_weight
            + preference * self.config.preference_weight;
        Some(ScoreBreakdown {
            capability,
            resource,
            health,
            preference,
            total,
        })
    }

    fn resource_score(&self, request: &Request, worker: &WorkerDescriptor) -> f64 {
        if !worker.supports_kind(&request.kind) {
            return 0.0;
        }
        if request.heavy {
            if self.config.gate_heavy_to_user_compute && !worker.flags.runs_on_user_compute {
                return 0.0;
            }
            return 1.0;
        }
        if worker.flags.runs_on_user_compute {
            // Keep light work on the operator fleet when possible.
            return self.config.light_on_user_compute_penalty;
        }
        1.0
    }

    fn break_ties<'a>(
        &self,
        request_id: &RequestId,
        survivors: Vec<&'a (RoutableWorker, ScoreBreakdown)>,
    ) -> &'a (RoutableWorker, ScoreBreakdown) {
        let best_total = survivors
            .iter()
            .map(|(_, b)| b.total)
            .fold(f64::MIN, f64::max);
        let mut tied: Vec<&(RoutableWorker, ScoreBreakdown)> = survivors
            .into_iter()
            .filter(|(_, b)| (best_total - b.total).abs() < SCORE_EPSILON)
            .collect();
        if tied.len() == 1 {
            return tied[0];
        }

        // Lower in-flight wins, then higher priority flag.
        tied.sort_by(|a, b| {
            let load_a = self.load.in_flight(&a.0.descriptor.id);
            let load_b = self.load.in_flight(&b.0.descriptor.id);
            load_a
                .cmp(&load_b)
                .then(b.0.descriptor.flags.priority.cmp(&a.0.descriptor.flags.priority))
        });
        let (top_load, top_priority) = (
            self.load.in_flight(&tied[0].0.descriptor.id),
            tied[0].0.descriptor.flags.priority,
        );
        let finalists: Vec<&(RoutableWorker, ScoreBreakdown)> = tied
            .into_iter()
            .filter(|(w, _)| {
                self.load.in_flight(&w.descriptor.id) == top_load
                    && w.descriptor.flags.priority == top_priority
            })
            .collect();

        // Stable pseudo-random pick seeded on the request id, so routing
        // stays reproducible for a given request.
        let mut rng = StdRng::seed_from_u64(seed_from_request(request_id));
        finalists[rng.gen_range(0..finalists.len())]
    }

    fn cached_route(&self, key: &CacheKey) -> Option<WorkerId> {
        let cache = self.cache.lock().expect("route cache lock poisoned");
        cache.get(key).and_then(|entry| {
            (entry.cached_at.elapsed() <= self.config.cache_ttl)
                .then(|| entry.worker_id.clone())
        })
    }

    fn record_decision(&self, decision: RouteDecision) {
        let mut ring = self.decisions.lock().expect("decision ring lock poisoned");
        if ring.len() >= self.config.decision_ring_capacity {
            ring.pop_front();
        }
        ring.push_back(decision);
    }

    /// Most recent routing decisions, newest last.
    pub fn recent_decisions(&self, limit: usize) -> Vec<RouteDecision> {
        let ring = self.decisions.lock().expect("decision ring lock poisoned");
        ring.iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Operator control: drop every memoized route.
    pub fn flush_cache(&self) {
        self.cache.lock().expect("route cache lock poisoned").clear();
    }
}

fn capability_score(request: &Request, worker: &WorkerDescriptor) -> f64 {
    if request.required_capabilities.is_empty() {
        return 1.0;
    }
    let satisfied = request
        .required_capabilities
        .iter()
        .filter(|required| worker.satisfies(required))
        .count();
    satisfied as f64 / request.required_capabilities.len() as f64
}

fn health_score(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Healthy => 1.0,
        HealthStatus::Warning => 0.7,
        HealthStatus::Unhealthy => 0.3,
        HealthStatus::Unknown | HealthStatus::Offline => 0.0,
    }
}

fn seed_from_request(request_id: &RequestId) -> u64 {
    let mut hasher = DefaultHasher::new();
    request_id.as_str().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_registry::{Registry, RegistryConfig};
    use foreman_test_utils::{cap, request, worker, MockTransport};

    fn router_over(registry: Arc<Registry>) -> Router {
        Router::new(registry, Arc::new(NoLoad), RouterConfig::default())
    }

    async fn registry_with_workers(
        transport: Arc<MockTransport>,
        workers: Vec<foreman_protocol::WorkerDescriptor>,
    ) -> Arc<Registry> {
        let registry = Arc::new(Registry::new(transport, RegistryConfig::default()));
        for w in workers {
            registry.register(w);
        }
        registry.probe_all().await;
        registry
    }

    #[tokio::test]
    async fn test_happy_path_picks_satisfying_worker() {
        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(
            transport,
            vec![worker("w1")
                .kind("code_analysis")
                .capability(cap("code_analysis", "1.0.0", &["read"]))
                .build()],
        )
        .await;
        let router = router_over(registry);

        let req = request("alice", "code_analysis")
            .with_capabilities(vec![cap("code_analysis", "1.0.0", &["read"])]);
        let chosen = router.route(&req).unwrap();
        assert_eq!(chosen.id.as_str(), "w1");

        let decisions = router.recent_decisions(10);
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].breakdown.total > 0.9);
    }

    #[tokio::test]
    async fn test_no_worker_for_unknown_kind() {
        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(transport, vec![]).await;
        let router = router_over(registry);
        let req = request("alice", "security_scan");
        assert_eq!(
            router.route(&req),
            Err(OrchestratorError::NoWorkerAvailable)
        );
    }

    #[tokio::test]
    async fn test_stale_capability_version_yields_no_worker() {
        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(
            transport,
            vec![worker("old")
                .kind("code_analysis")
                .capability(cap("code_analysis", "0.9.0", &["read"]))
                .build()],
        )
        .await;
        let router = router_over(registry);
        let req = request("alice", "code_analysis")
            .with_capabilities(vec![cap("code_analysis", "1.0.0", &["read"])]);
        assert_eq!(
            router.route(&req),
            Err(OrchestratorError::NoWorkerAvailable)
        );
    }

    #[tokio::test]
    async fn test_empty_requirements_score_full_capability() {
        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(
            transport,
            vec![worker("w1").kind("code_analysis").build()],
        )
        .await;
        let router = router_over(registry);
        let req = request("alice", "code_analysis");
        router.route(&req).unwrap();
        let decision = &router.recent_decisions(1)[0];
        assert_eq!(decision.breakdown.capability, 1.0);
    }

    #[tokio::test]
    async fn test_heavy_request_with_no_user_compute_fails() {
        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(
            transport,
            vec![worker("operator-only").kind("bulk_index").build()],
        )
        .await;
        let router = router_over(registry);
        let req = request("alice", "bulk_index").with_heavy(true);
        assert_eq!(
            router.route(&req),
            Err(OrchestratorError::NoWorkerAvailable)
        );
    }

    #[tokio::test]
    async fn test_heavy_request_lands_on_user_compute() {
        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(
            transport,
            vec![
                worker("operator-only").kind("bulk_index").build(),
                worker("user-node").kind("bulk_index").user_compute().build(),
            ],
        )
        .await;
        let router = router_over(registry);
        let req = request("alice", "bulk_index").with_heavy(true);
        let chosen = router.route(&req).unwrap();
        assert_eq!(chosen.id.as_str(), "user-node");
    }

    #[tokio::test]
    async fn test_light_request_prefers_operator_fleet() {
        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(
            transport,
            vec![
                worker("user-node").kind("code_analysis").user_compute().build(),
                worker("operator").kind("code_analysis").build(),
            ],
        )
        .await;
        let router = router_over(registry);
        let chosen = router.route(&request("alice", "code_analysis")).unwrap();
        assert_eq!(chosen.id.as_str(), "operator");
    }

    #[tokio::test]
    async fn test_warning_worker_scores_lower() {
        let transport = Arc::new(MockTransport::new());
        let warned = worker("warned").kind("code_analysis").build();
        transport.enqueue_health(
            &warned.id,
            Ok(serde_json::from_str(r#"{"status":"warning"}"#).unwrap()),
        );
        let registry = registry_with_workers(
            transport,
            vec![warned, worker("healthy").kind("code_analysis").build()],
        )
        .await;
        let router = router_over(registry);
        let chosen = router.route(&request("alice", "code_analysis")).unwrap();
        assert_eq!(chosen.id.as_str(), "healthy");
    }

    #[tokio::test]
    async fn test_tie_break_on_in_flight_then_priority() {
        struct FixedLoad;
        impl WorkerLoad for FixedLoad {
            fn in_flight(&self, id: &WorkerId) -> u32 {
                if id.as_str() == "busy" {
                    3
                } else {
                    0
                }
            }
        }

        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(
            transport,
            vec![
                worker("busy").kind("code_analysis").build(),
                worker("idle-lo").kind("code_analysis").build(),
                worker("idle-hi").kind("code_analysis").priority(7).build(),
            ],
        )
        .await;
        let router = Router::new(registry, Arc::new(FixedLoad), RouterConfig::default());
        let chosen = router.route(&request("alice", "code_analysis")).unwrap();
        assert_eq!(chosen.id.as_str(), "idle-hi");
    }

    #[tokio::test]
    async fn test_tie_break_is_reproducible_per_request() {
        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(
            transport,
            vec![
                worker("twin-a").kind("code_analysis").build(),
                worker("twin-b").kind("code_analysis").build(),
            ],
        )
        .await;
        let router = router_over(registry);
        let req = request("alice", "code_analysis");
        let first = router.route(&req).unwrap();
        router.flush_cache();
        let second = router.route(&req).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_cache_hit_revalidates_health() {
        let transport = Arc::new(MockTransport::new());
        let w = worker("w1").kind("code_analysis").build();
        let registry = registry_with_workers(transport.clone(), vec![w.clone()]).await;
        let router = router_over(registry.clone());
        let req = request("alice", "code_analysis");
        router.route(&req).unwrap();

        // Worker goes offline; the cached decision must not be returned.
        for _ in 0..3 {
            transport.enqueue_health(&w.id, Err(foreman_protocol::DispatchError::Timeout));
            registry.probe(&w.id).await.unwrap();
        }
        assert_eq!(
            router.route(&req),
            Err(OrchestratorError::NoWorkerAvailable)
        );
    }

    #[tokio::test]
    async fn test_decision_ring_is_bounded() {
        let transport = Arc::new(MockTransport::new());
        let registry = registry_with_workers(
            transport,
            vec![worker("w1").kind("code_analysis").build()],
        )
        .await;
        let mut config = RouterConfig::default();
        config.decision_ring_capacity = 4;
        let router = Router::new(registry, Arc::new(NoLoad), config);
        for _ in 0..10 {
            // Flush so every route is a fresh decision, not a cache hit.
            router.flush_cache();
            router.route(&request("alice", "code_analysis")).unwrap();
        }
        assert_eq!(router.recent_decisions(100).len(), 4);
    }
}
