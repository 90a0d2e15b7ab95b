//! Test fixtures shared across the Foreman crates.
//!
//! Provides throwaway RSA keys, fluent builders for descriptors and
//! requests, and a scripted [`MockTransport`] that plays back per-worker
//! dispatch/health outcomes while recording every call it sees.

pub mod builders;
pub mod keys;
pub mod transport;

pub use builders::{cap, request, worker};
pub use transport::{decode_claims_unverified, MockTransport, RecordedDispatch};
