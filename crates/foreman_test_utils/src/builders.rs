//! Fluent builders for descriptors and requests used throughout the tests.

use foreman_protocol::{
    Capability, Payload, Request, RoutingFlags, WorkerDescriptor, WorkerId,
};
use semver::Version;

/// Build a capability; `version` must be valid semver.
pub fn cap(name: &str, version: &str, parameters: &[&str]) -> Capability {
    Capability::new(name, Version::parse(version).expect("valid semver"))
        .with_parameters(parameters.iter().copied())
}

/// Start building a worker descriptor with sensible defaults.
pub fn worker(id: &str) -> WorkerBuilder {
    WorkerBuilder {
        descriptor: WorkerDescriptor {
            id: WorkerId::from(id),
            name: id.to_string(),
            endpoint: format!("http://{id}.test:9000"),
            capabilities: Vec::new(),
            task_kinds: Vec::new(),
            flags: RoutingFlags::default(),
        },
    }
}

pub struct WorkerBuilder {
    descriptor: WorkerDescriptor,
}

impl WorkerBuilder {
    pub fn kind(mut self, kind: &str) -> Self {
        self.descriptor.task_kinds.push(kind.to_string());
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.descriptor.capabilities.push(capability);
        self
    }

    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.descriptor.endpoint = endpoint.to_string();
        self
    }

    pub fn user_compute(mut self) -> Self {
        self.descriptor.flags.runs_on_user_compute = true;
        self
    }

    pub fn prefers_pointer(mut self) -> Self {
        self.descriptor.flags.prefers_pointer_result = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.descriptor.flags.priority = priority;
        self
    }

    pub fn max_in_flight(mut self, max_in_flight: u32) -> Self {
        self.descriptor.flags.max_in_flight = max_in_flight;
        self
    }

    pub fn default_deadline_secs(mut self, secs: u64) -> Self {
        self.descriptor.flags.default_deadline_secs = secs;
        self
    }

    pub fn build(self) -> WorkerDescriptor {
        self.descriptor
    }
}

/// A minimal request with a small JSON payload.
pub fn request(owner: &str, kind: &str) -> Request {
    Request::new(
        owner,
        kind,
        Payload::new(br#"{"input":"fixture"}"#.to_vec(), "application/json"),
    )
}
