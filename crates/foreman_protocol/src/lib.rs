//! Protocol types shared across the Foreman control plane.
//!
//! Everything that crosses a crate boundary lives here: identifiers,
//! the capability/worker/request/job/result data model, the error
//! taxonomy, wire payloads, and canonical configuration defaults.

pub mod capability;
pub mod checksum;
pub mod config;
pub mod defaults;
pub mod error;
pub mod ids;
pub mod job;
pub mod request;
pub mod result;
pub mod wire;
pub mod worker;

pub use capability::Capability;
pub use checksum::sha256_hex;
pub use error::{
    DispatchError, EnvelopeError, ErrorKind, OrchestratorError, StoreError,
};
pub use ids::{IdParseError, JobId, RequestId, ResultId, WorkerId};
pub use job::{Job, JobState};
pub use request::{
    FailureInfo, Payload, Request, RequestPriority, RequestState, RequestStatus,
};
pub use result::{Locator, ResultBody, ResultKind, StoredResult};
pub use wire::{
    AsyncAck, CallbackPayload, CallbackStatus, ExecuteRequest, HealthReport,
    ReportedHealth, WorkerManifest,
};
pub use worker::{HealthStatus, RoutingFlags, WorkerDescriptor, WorkerHealth};
