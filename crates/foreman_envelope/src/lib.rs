//! Short-lived signed job envelopes (RS256).
//!
//! The orchestrator signs an envelope for every dispatch; workers verify
//! it with the orchestrator's public key, and callbacks carry an envelope
//! back the other way. Keys are loaded once at start. Rotation works by
//! listing several public keys at the verifier; the signer always uses
//! the newest private key.

use chrono::Utc;
use foreman_protocol::{EnvelopeError, JobId};
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Claims carried by a signed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeClaims {
    /// Job id this envelope authorizes.
    pub task_id: JobId,
    pub iss: String,
    pub owner: String,
    /// SHA256 of the dispatched payload, binding token to content.
    pub payload_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    /// Optional content version pin.
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
    pub callback_url: String,
    /// Required by workers that host untrusted user compute.
    pub consent_given: bool,
    pub iat: i64,
    pub exp: i64,
}

/// Everything the caller supplies; `iss`/`iat`/`exp` are stamped at signing.
#[derive(Debug, Clone)]
pub struct EnvelopeDraft {
    pub task_id: JobId,
    pub owner: String,
    pub payload_digest: String,
    pub repo_url: Option<String>,
    pub content_ref: Option<String>,
    pub callback_url: String,
    pub consent_given: bool,
}

/// Envelope signer holding the orchestrator's private key.
pub struct EnvelopeSigner {
    encoding_key: Option<EncodingKey>,
    issuer: String,
    ttl: Duration,
}

impl EnvelopeSigner {
    /// Build a signer from an RSA private key in PEM form.
    pub fn from_pem(
        private_key_pem: &[u8],
        issuer: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, EnvelopeError> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| EnvelopeError::Malformed(format!("bad private key: {e}")))?;
        Ok(Self {
            encoding_key: Some(encoding_key),
            issuer: issuer.into(),
            ttl,
        })
    }

    /// A signer with no key; every `sign` call refuses. Used by deployments
    /// that only verify (e.g. a callback-receiving replica).
    pub fn unkeyed(issuer: impl Into<String>, ttl: Duration) -> Self {
        Self {
            encoding_key: None,
            issuer: issuer.into(),
            ttl,
        }
    }

    pub fn can_sign(&self) -> bool {
        self.encoding_key.is_some()
    }

    /// Sign a draft, stamping `iss`, `iat`, and `exp = iat + ttl`.
    pub fn sign(&self, draft: EnvelopeDraft) -> Result<String, EnvelopeError> {
        let key = self
            .encoding_key
            .as_ref()
            .ok_or(EnvelopeError::NoSigningKey)?;
        let now = Utc::now().timestamp();
        let claims = EnvelopeClaims {
            task_id: draft.task_id,
            iss: self.issuer.clone(),
            owner: draft.owner,
            payload_digest: draft.payload_digest,
            repo_url: draft.repo_url,
            content_ref: draft.content_ref,
            callback_url: draft.callback_url,
            consent_given: draft.consent_given,
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        debug!(task_id = %claims.task_id, exp = claims.exp, "signing envelope");
        encode(&Header::new(Algorithm::RS256), &claims, key)
            .map_err(|e| EnvelopeError::Malformed(format!("encoding failed: {e}")))
    }
}

/// Envelope verifier holding one or more acceptable public keys.
pub struct EnvelopeVerifier {
    decoding_keys: Vec<DecodingKey>,
    expected_issuer: Option<String>,
    max_ttl: Duration,
    clock_skew: Duration,
}

impl EnvelopeVerifier {
    /// Build a verifier from RSA public keys in PEM form. More than one
    /// key supports rotation; keys are tried in the order given.
    pub fn from_pems<P: AsRef<[u8]>>(
        public_key_pems: &[P],
        max_ttl: Duration,
        clock_skew: Duration,
    ) -> Result<Self, EnvelopeError> {
        if public_key_pems.is_empty() {
            return Err(EnvelopeError::Malformed(
                "no verification keys configured".to_string(),
            ));
        }
        let mut decoding_keys = Vec::with_capacity(public_key_pems.len());
        for pem in public_key_pems {
            let key = DecodingKey::from_rsa_pem(pem.as_ref())
                .map_err(|e| EnvelopeError::Malformed(format!("bad public key: {e}")))?;
            decoding_keys.push(key);
        }
        Ok(Self {
            decoding_keys,
            expected_issuer: None,
            max_ttl,
            clock_skew,
        })
    }

    /// Additionally require the `iss` claim to match.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }

    /// Validate signature and time claims; returns the verified claims.
    pub fn verify(&self, token: &str) -> Result<EnvelopeClaims, EnvelopeError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);

        let mut last_err = EnvelopeError::BadSignature;
        for key in &self.decoding_keys {
            match decode::<EnvelopeClaims>(token, key, &validation) {
                Ok(data) => return self.check_claims(data.claims),
                Err(e) => {
                    let mapped = map_jwt_error(&e);
                    // Only a signature mismatch is worth trying the next
                    // key for; structural and time failures are final.
                    if !matches!(mapped, EnvelopeError::BadSignature) {
                        return Err(mapped);
                    }
                    last_err = mapped;
                }
            }
        }
        Err(last_err)
    }

    fn check_claims(&self, claims: EnvelopeClaims) -> Result<EnvelopeClaims, EnvelopeError> {
        let now = Utc::now().timestamp();
        let skew = self.clock_skew.as_secs() as i64;

        if claims.iat > now + skew {
            return Err(EnvelopeError::Malformed(
                "issued-at is in the future".to_string(),
            ));
        }
        let lifetime = claims.exp.saturating_sub(claims.iat);
        if lifetime > self.max_ttl.as_secs() as i64 {
            return Err(EnvelopeError::Malformed(format!(
                "lifetime {lifetime}s exceeds maximum {}s",
                self.max_ttl.as_secs()
            )));
        }
        if let Some(expected) = &self.expected_issuer {
            if &claims.iss != expected {
                return Err(EnvelopeError::WrongAudience);
            }
        }
        Ok(claims)
    }
}

fn map_jwt_error(err: &jsonwebtoken::errors::Error) -> EnvelopeError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => EnvelopeError::Expired,
        ErrorKind::InvalidSignature => EnvelopeError::BadSignature,
        ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => EnvelopeError::WrongAudience,
        ErrorKind::ImmatureSignature => {
            EnvelopeError::Malformed("token not yet valid".to_string())
        }
        other => EnvelopeError::Malformed(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_test_utils::keys;

    const TTL: Duration = Duration::from_secs(900);
    const SKEW: Duration = Duration::from_secs(60);

    fn signer() -> EnvelopeSigner {
        EnvelopeSigner::from_pem(keys::TEST_RSA_PRIVATE.as_bytes(), "foreman", TTL).unwrap()
    }

    fn verifier() -> EnvelopeVerifier {
        EnvelopeVerifier::from_pems(&[keys::TEST_RSA_PUBLIC.as_bytes()], TTL, SKEW).unwrap()
    }

    fn draft(task_id: JobId) -> EnvelopeDraft {
        EnvelopeDraft {
            task_id,
            owner: "alice".to_string(),
            payload_digest: "deadbeef".to_string(),
            repo_url: None,
            content_ref: None,
            callback_url: "http://127.0.0.1:8700/callback".to_string(),
            consent_given: true,
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let task_id = JobId::new();
        let token = signer().sign(draft(task_id.clone())).unwrap();
        let claims = verifier().verify(&token).unwrap();
        assert_eq!(claims.task_id, task_id);
        assert_eq!(claims.owner, "alice");
        assert_eq!(claims.iss, "foreman");
        assert_eq!(claims.exp - claims.iat, TTL.as_secs() as i64);
    }

    #[test]
    fn test_unkeyed_signer_refuses() {
        let signer = EnvelopeSigner::unkeyed("foreman", TTL);
        assert!(!signer.can_sign());
        assert_eq!(
            signer.sign(draft(JobId::new())),
            Err(EnvelopeError::NoSigningKey)
        );
    }

    #[test]
    fn test_wrong_key_is_bad_signature() {
        let token = signer().sign(draft(JobId::new())).unwrap();
        let other =
            EnvelopeVerifier::from_pems(&[keys::ALT_RSA_PUBLIC.as_bytes()], TTL, SKEW).unwrap();
        assert_eq!(other.verify(&token), Err(EnvelopeError::BadSignature));
    }

    #[test]
    fn test_rotation_tries_all_keys() {
        let token = signer().sign(draft(JobId::new())).unwrap();
        let rotated = EnvelopeVerifier::from_pems(
            &[keys::ALT_RSA_PUBLIC.as_bytes(), keys::TEST_RSA_PUBLIC.as_bytes()],
            TTL,
            SKEW,
        )
        .unwrap();
        assert!(rotated.verify(&token).is_ok());
    }

    #[test]
    fn test_garbage_is_malformed() {
        let result = verifier().verify("not.a.token");
        assert!(matches!(result, Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn test_issuer_mismatch_is_wrong_audience() {
        let token = signer().sign(draft(JobId::new())).unwrap();
        let strict = verifier().with_issuer("someone-else");
        assert_eq!(strict.verify(&token), Err(EnvelopeError::WrongAudience));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Zero-ttl signer: exp == iat, and skew below a second.
        let signer =
            EnvelopeSigner::from_pem(keys::TEST_RSA_PRIVATE.as_bytes(), "foreman", Duration::ZERO)
                .unwrap();
        let token = signer.sign(draft(JobId::new())).unwrap();
        let strict =
            EnvelopeVerifier::from_pems(&[keys::TEST_RSA_PUBLIC.as_bytes()], TTL, Duration::ZERO)
                .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(strict.verify(&token), Err(EnvelopeError::Expired));
    }

    #[test]
    fn test_overlong_lifetime_rejected() {
        // Signer hands out hour-long tokens; verifier caps at 15 minutes.
        let generous = EnvelopeSigner::from_pem(
            keys::TEST_RSA_PRIVATE.as_bytes(),
            "foreman",
            Duration::from_secs(3600),
        )
        .unwrap();
        let token = generous.sign(draft(JobId::new())).unwrap();
        let result = verifier().verify(&token);
        assert!(matches!(result, Err(EnvelopeError::Malformed(_))));
    }
}
