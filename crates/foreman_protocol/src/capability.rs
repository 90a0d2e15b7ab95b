//! Capability model: what a worker can do, and what a request needs.

use crate::checksum::sha256_hex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single declared or required capability.
///
/// Satisfaction is directional: a worker's declared capability satisfies
/// a requirement when the names match, the declared version is at least
/// the required version (semver order), and the required parameter set is
/// a subset of the declared one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub parameters: BTreeSet<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            parameters: BTreeSet::new(),
        }
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    /// True when `self` (a declared capability) satisfies `required`.
    pub fn satisfies(&self, required: &Capability) -> bool {
        self.name == required.name
            && self.version >= required.version
            && required.parameters.is_subset(&self.parameters)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Stable fingerprint of a requirement set, used as part of route cache keys.
///
/// Order-insensitive: capabilities are sorted before hashing.
pub fn fingerprint(capabilities: &[Capability]) -> String {
    let mut parts: Vec<String> = capabilities
        .iter()
        .map(|cap| {
            let params: Vec<&str> = cap.parameters.iter().map(String::as_str).collect();
            format!("{}@{}[{}]", cap.name, cap.version, params.join(","))
        })
        .collect();
    parts.sort();
    sha256_hex(parts.join(";").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(name: &str, version: &str, params: &[&str]) -> Capability {
        Capability::new(name, Version::parse(version).unwrap())
            .with_parameters(params.iter().copied())
    }

    #[test]
    fn test_satisfies_exact_match() {
        let declared = cap("code_analysis", "1.0.0", &["read"]);
        let required = cap("code_analysis", "1.0.0", &["read"]);
        assert!(declared.satisfies(&required));
    }

    #[test]
    fn test_satisfies_newer_version() {
        let declared = cap("code_analysis", "1.2.0", &["read", "write"]);
        let required = cap("code_analysis", "1.0.0", &["read"]);
        assert!(declared.satisfies(&required));
    }

    #[test]
    fn test_rejects_older_version() {
        let declared = cap("code_analysis", "0.9.0", &["read"]);
        let required = cap("code_analysis", "1.0.0", &["read"]);
        assert!(!declared.satisfies(&required));
    }

    #[test]
    fn test_rejects_missing_parameter() {
        let declared = cap("code_analysis", "1.0.0", &["read"]);
        let required = cap("code_analysis", "1.0.0", &["read", "write"]);
        assert!(!declared.satisfies(&required));
    }

    #[test]
    fn test_rejects_name_mismatch() {
        let declared = cap("security_scan", "1.0.0", &[]);
        let required = cap("code_analysis", "1.0.0", &[]);
        assert!(!declared.satisfies(&required));
    }

    #[test]
    fn test_fingerprint_is_order_insensitive() {
        let a = vec![cap("a", "1.0.0", &["x"]), cap("b", "2.0.0", &[])];
        let b = vec![cap("b", "2.0.0", &[]), cap("a", "1.0.0", &["x"])];
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&[]));
    }
}
