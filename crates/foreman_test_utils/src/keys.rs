//! RSA key material for envelope tests. Generated once for the test
//! suite; never use these outside of tests.

pub const TEST_RSA_PRIVATE: &str = include_str!("keys/test_rsa_private.pem");
pub const TEST_RSA_PUBLIC: &str = include_str!("keys/test_rsa_public.pem");

/// A second, unrelated pair for wrong-key and rotation tests.
pub const ALT_RSA_PRIVATE: &str = include_str!("keys/alt_rsa_private.pem");
pub const ALT_RSA_PUBLIC: &str = include_str!("keys/alt_rsa_public.pem");
