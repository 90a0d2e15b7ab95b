//! Stored results: the artifact produced by a job, inline or indirected.

use crate::ids::{RequestId, ResultId};
use crate::request::FailureInfo;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// How the artifact body is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Artifact bytes stored directly on the record.
    Inline,
    /// Artifact lives in a blob backend; the record holds the locator.
    Pointer,
    /// The request terminated with a typed failure.
    Error,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Inline => "inline",
            ResultKind::Pointer => "pointer",
            ResultKind::Error => "error",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Locator into a blob backend, `backend:key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub backend: String,
    pub key: String,
}

impl Locator {
    pub fn new(backend: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.key)
    }
}

/// Result body, discriminated by storage shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResultBody {
    Inline {
        #[serde(
            serialize_with = "serialize_base64",
            deserialize_with = "deserialize_base64"
        )]
        bytes: Vec<u8>,
        content_type: String,
    },
    Pointer {
        locator: Locator,
        content_type: String,
    },
    Error {
        failure: FailureInfo,
    },
}

impl ResultBody {
    pub fn kind(&self) -> ResultKind {
        match self {
            ResultBody::Inline { .. } => ResultKind::Inline,
            ResultBody::Pointer { .. } => ResultKind::Pointer,
            ResultBody::Error { .. } => ResultKind::Error,
        }
    }
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// A persisted result record, owned by the caller that created the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: ResultId,
    pub request_id: RequestId,
    pub owner: String,
    pub kind: ResultKind,
    pub body: ResultBody,
    pub created_at: DateTime<Utc>,
    /// Artifact size in bytes (pre-indirection size for pointers).
    pub size: u64,
    /// Hex SHA256 of the artifact bytes; empty for error results.
    pub checksum: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_body_kind() {
        let inline = ResultBody::Inline {
            bytes: vec![1, 2, 3],
            content_type: "application/octet-stream".to_string(),
        };
        assert_eq!(inline.kind(), ResultKind::Inline);

        let pointer = ResultBody::Pointer {
            locator: Locator::new("fs", "ab/cd"),
            content_type: "application/json".to_string(),
        };
        assert_eq!(pointer.kind(), ResultKind::Pointer);

        let error = ResultBody::Error {
            failure: FailureInfo {
                kind: ErrorKind::JobTimeout,
                message: "deadline exceeded".to_string(),
            },
        };
        assert_eq!(error.kind(), ResultKind::Error);
    }

    #[test]
    fn test_body_serialization_tags_kind() {
        let pointer = ResultBody::Pointer {
            locator: Locator::new("fs", "ab/cd"),
            content_type: "application/json".to_string(),
        };
        let json = serde_json::to_string(&pointer).unwrap();
        assert!(json.contains("\"kind\":\"pointer\""));
        let back: ResultBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pointer);
    }

    #[test]
    fn test_locator_display() {
        assert_eq!(Locator::new("mem", "42").to_string(), "mem:42");
    }
}
