//! Job dispatch: queue, state machine, retries, finalization.

pub mod backoff;
pub mod manager;
pub mod metrics;
pub mod queue;

pub use manager::{DispatchConfig, InFlightTracker, JobManager};
pub use metrics::{Metrics, MetricsSnapshot};
pub use queue::JobQueue;
