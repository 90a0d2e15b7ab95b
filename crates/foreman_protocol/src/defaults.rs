//! Canonical default values shared across the control plane.

/// How often the probe loop refreshes worker health, seconds.
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 60;
/// Cached health is considered fresh for this long, seconds.
pub const DEFAULT_HEALTH_TTL_SECS: u64 = 60;
/// Budget for a single health probe, seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
/// Minimum spacing between probes of the same worker, seconds.
pub const DEFAULT_PROBE_MIN_SPACING_SECS: u64 = 5;
/// Consecutive probe failures before a worker is marked offline.
pub const DEFAULT_OFFLINE_THRESHOLD: u32 = 3;

/// Global cap on concurrently running jobs.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;
/// Per-worker in-flight cap applied when a descriptor does not set one.
pub const DEFAULT_WORKER_MAX_IN_FLIGHT: u32 = 4;
/// Job deadline applied when neither request nor worker sets one, seconds.
pub const DEFAULT_JOB_DEADLINE_SECS: u64 = 300;
/// Attempts per request unless the caller overrides.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Retry backoff base, seconds.
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 1;
/// Retry backoff cap, seconds.
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 60;

/// Route cache entry lifetime, seconds.
pub const DEFAULT_ROUTE_CACHE_TTL_SECS: u64 = 300;
/// Candidates scoring below this are dropped.
pub const DEFAULT_SCORE_FLOOR: f64 = 0.2;
/// Routing decisions kept for introspection.
pub const DEFAULT_DECISION_RING_CAPACITY: usize = 256;

/// Results at or below this many bytes are stored inline.
pub const DEFAULT_INLINE_THRESHOLD: usize = 64 * 1024;
/// Result cache entry count cap.
pub const DEFAULT_RESULT_CACHE_ENTRIES: usize = 256;
/// Result cache entry lifetime, seconds.
pub const DEFAULT_RESULT_CACHE_TTL_SECS: u64 = 3600;
/// Result retention, seconds (30 days).
pub const DEFAULT_RESULT_RETENTION_SECS: u64 = 30 * 24 * 3600;

/// Envelope lifetime, seconds (15 minutes). Also the verifier's ceiling.
pub const DEFAULT_ENVELOPE_TTL_SECS: u64 = 15 * 60;
/// Tolerated clock skew on issued-at, seconds.
pub const DEFAULT_CLOCK_SKEW_SECS: u64 = 60;

/// Issuer claim stamped into outbound envelopes.
pub const DEFAULT_ISSUER: &str = "foreman";
/// Where async workers post completions unless configured otherwise.
pub const DEFAULT_CALLBACK_URL: &str = "http://127.0.0.1:8700/callback";
/// Default state store.
pub const DEFAULT_STATE_URL: &str = "memory:";
