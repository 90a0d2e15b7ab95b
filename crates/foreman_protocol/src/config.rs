//! System configuration shared by the launcher and the orchestrator.

use std::path::PathBuf;

/// Canonical system configuration used by the `foreman` binary.
///
/// Component-level tunables (router weights, cache sizes, backoff curve)
/// live in each component's own config struct; this is the deployment
/// surface: where state lives, which keys sign envelopes, and which
/// fleet file seeds the registry.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// State store URL (`memory:` | `sqlite:/path/to.db`).
    pub state_url: String,
    /// PEM file holding the RS256 signing key.
    pub signing_key_path: Option<PathBuf>,
    /// PEM files holding acceptable verification keys, newest first.
    pub verify_key_paths: Vec<PathBuf>,
    /// TOML file describing the operator-hosted fleet to register at boot.
    pub fleet_path: Option<PathBuf>,
    /// Callback URL advertised to async workers.
    pub callback_url: String,
    /// Issuer stamped into envelopes.
    pub issuer: String,
    /// Directory for pointer-result blobs; memory-backed when absent.
    pub blob_root: Option<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            state_url: crate::defaults::DEFAULT_STATE_URL.to_string(),
            signing_key_path: None,
            verify_key_paths: Vec::new(),
            fleet_path: None,
            callback_url: crate::defaults::DEFAULT_CALLBACK_URL.to_string(),
            issuer: crate::defaults::DEFAULT_ISSUER.to_string(),
            blob_root: None,
        }
    }
}
