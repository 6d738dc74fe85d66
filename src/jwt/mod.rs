//! JWT verification against multiple identity providers.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to read `kid` and `alg`.
//! 2. Ask the configured [`KeyResolver`] for the key; provider key sets tag
//!    the result with the owning provider's name.
//! 3. Verify the signature and the registered time claims (`exp`, `nbf`)
//!    with a small clock leeway. Audience is not checked here.
//! 4. Return the dynamic claim map together with the provider tag.

pub mod claims;
pub mod keys;
pub mod keyset;

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Header, Validation};
use tracing::debug;

pub use claims::{ClaimValue, Claims};
pub use keys::{KeyError, KeyResolver, ResolvedKey, StaticKeys};
pub use keyset::{MultiKeyResolver, ProviderKeySet};

/// Default clock skew tolerance in seconds.
pub const DEFAULT_LEEWAY_SECS: u64 = 60;

/// Errors raised while verifying a token.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The token is not a decodable JWT.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// No key could be resolved for the token.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Signature or claim validation failed.
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    /// A valid token of a kind that may not be used as an access token.
    #[error("token type {0:?} is not accepted")]
    WrongType(String),
}

/// A token that passed verification.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// Decoded header
    pub header: Header,
    /// Verified payload
    pub claims: Claims,
    /// Provider whose key set verified the token; `None` for static keys.
    pub provider: Option<String>,
}

/// Verifies JWTs with keys from a [`KeyResolver`].
#[derive(Clone)]
pub struct TokenVerifier {
    resolver: Arc<dyn KeyResolver>,
    leeway: u64,
}

impl TokenVerifier {
    /// Verifier with the default leeway.
    #[must_use]
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self {
            resolver,
            leeway: DEFAULT_LEEWAY_SECS,
        }
    }

    /// Override the clock skew tolerance.
    #[must_use]
    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway = leeway_secs;
        self
    }

    /// Verify `token` and return its claims and provider tag.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, VerifyError> {
        let header = jsonwebtoken::decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let resolved = self.resolver.resolve(&header)?;

        let validation = self.build_validation(&header);
        let data = jsonwebtoken::decode::<Claims>(token, &resolved.key, &validation)?;

        debug!(kid = ?data.header.kid, provider = ?resolved.provider, "Token verified");
        Ok(VerifiedToken {
            header: data.header,
            claims: data.claims,
            provider: resolved.provider,
        })
    }

    fn build_validation(&self, header: &Header) -> Validation {
        let mut v = Validation::new(header.alg);
        v.leeway = self.leeway;
        v.validate_aud = false;
        v.validate_nbf = true;
        v
    }
}

/// Read the claims of a JWT without checking its signature.
///
/// Only for decisions that are re-checked by a full verification afterwards,
/// such as whether a stored access token is due for refresh.
pub fn unverified_claims(token: &str) -> Result<Claims, VerifyError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| VerifyError::Malformed("expected three dot-separated segments".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| VerifyError::Malformed(e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| VerifyError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{Algorithm, EncodingKey};
    use serde_json::json;

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn sign(kid: &str, secret: &[u8], claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(Arc::new(
            StaticKeys::new().with_secret("k1", Algorithm::HS256, b"top-secret"),
        ))
    }

    #[test]
    fn valid_token_yields_claims() {
        let token = sign("k1", b"top-secret", &json!({"sub": "u1", "exp": now() + 300}));

        let verified = verifier().verify(&token).unwrap();

        assert_eq!(verified.claims.subject(), Some("u1"));
        assert!(verified.provider.is_none());
    }

    #[test]
    fn wrong_secret_fails_signature_check() {
        let token = sign("k1", b"another-secret", &json!({"exp": now() + 300}));

        assert!(matches!(verifier().verify(&token), Err(VerifyError::Invalid(_))));
    }

    #[test]
    fn expired_token_is_rejected_beyond_leeway() {
        let token = sign("k1", b"top-secret", &json!({"exp": now() - 600}));

        assert!(matches!(verifier().verify(&token), Err(VerifyError::Invalid(_))));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(verifier().verify("not-a-jwt"), Err(VerifyError::Malformed(_))));
    }

    #[test]
    fn unverified_claims_reads_payload_without_key() {
        let token = sign("unknown", b"whatever", &json!({"exp": 1234, "typ": "Bearer"}));

        let claims = unverified_claims(&token).unwrap();

        assert_eq!(claims.expires_at(), Some(1234));
        assert_eq!(claims.token_type(), Some("Bearer"));
    }
}
