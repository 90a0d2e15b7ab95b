//! Operator fleet file: the workers registered at boot.
//!
//! ```toml
//! [[worker]]
//! id = "tree-sitter"
//! name = "Tree-sitter analyzer"
//! endpoint = "http://localhost:9001"
//! task_kinds = ["code_analysis", "ast_parsing"]
//!
//! [worker.flags]
//! priority = 5
//!
//! [[worker.capabilities]]
//! name = "code_analysis"
//! version = "1.0.0"
//! parameters = ["parse", "ast"]
//! ```

use anyhow::{Context, Result};
use foreman_protocol::WorkerDescriptor;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct FleetFile {
    #[serde(default, rename = "worker")]
    workers: Vec<WorkerDescriptor>,
}

/// Load the seed fleet from a TOML file.
pub fn load_fleet(path: &Path) -> Result<Vec<WorkerDescriptor>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fleet file: {}", path.display()))?;
    let fleet: FleetFile = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse fleet file: {}", path.display()))?;
    Ok(fleet.workers)
}
