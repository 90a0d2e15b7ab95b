//! SHA256 hashing for artifact checksums and payload digests.

use sha2::{Digest, Sha256};

/// Compute the hex-encoded SHA256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_distinct_inputs_distinct_digests() {
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
    }
}
