//! Verification key resolution.
//!
//! A [`KeyResolver`] maps a JWT header to the key that must verify it. The
//! lookup is synchronous: resolvers answer from memory and never wait on the
//! network, so verification is never blocked behind a key refresh.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, Header};

use crate::config::StaticKeyConfig;

/// Errors raised while resolving a verification key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The resolver holds no key with this ID.
    #[error("key ID not found: {0:?}")]
    KidNotFound(String),

    /// No provider key set holds a key with this ID.
    #[error("failed to find key ID {0:?} in multiple JWKS")]
    KidNotFoundInSets(String),

    /// The key exists but is bound to a different algorithm.
    #[error("algorithm mismatch for key {kid:?}: key is {expected:?}, token uses {found:?}")]
    AlgorithmMismatch {
        /// Key ID
        kid: String,
        /// Algorithm configured for the key
        expected: Algorithm,
        /// Algorithm in the token header
        found: Algorithm,
    },

    /// Key material could not be parsed.
    #[error("invalid key {kid:?}: {reason}")]
    InvalidKey {
        /// Key ID
        kid: String,
        /// Parser message
        reason: String,
    },

    /// A provider has no JWKS URL.
    #[error("provider {0:?} has no cert_url")]
    MissingCertUrl(String),

    /// Fetching or parsing a JWKS document failed.
    #[error("JWKS fetch from {url} failed: {reason}")]
    Fetch {
        /// JWKS endpoint
        url: String,
        /// Failure description
        reason: String,
    },
}

impl KeyError {
    /// `true` for the "key ID not found" outcomes that let a caller move on
    /// to the next resolver.
    #[must_use]
    pub fn is_kid_not_found(&self) -> bool {
        matches!(self, Self::KidNotFound(_) | Self::KidNotFoundInSets(_))
    }
}

/// A verification key plus the provider that owns it, if known.
#[derive(Clone)]
pub struct ResolvedKey {
    /// Key used to check the signature.
    pub key: DecodingKey,
    /// Owning provider name. Static keys carry none.
    pub provider: Option<String>,
}

impl std::fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Finds the key for a token header.
pub trait KeyResolver: Send + Sync {
    /// Resolve the key for `header`.
    ///
    /// Implementations return [`KeyError::KidNotFound`] when they simply do
    /// not know the key ID, so that callers can fall through to another
    /// resolver; any other error is final.
    fn resolve(&self, header: &Header) -> Result<ResolvedKey, KeyError>;
}

struct StaticKey {
    algorithm: Algorithm,
    key: DecodingKey,
}

/// Fixed keys, indexed by key ID.
#[derive(Default)]
pub struct StaticKeys {
    keys: HashMap<String, StaticKey>,
}

impl StaticKeys {
    /// Empty key table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key.
    #[must_use]
    pub fn with_key(mut self, kid: impl Into<String>, algorithm: Algorithm, key: DecodingKey) -> Self {
        self.keys.insert(kid.into(), StaticKey { algorithm, key });
        self
    }

    /// Add an HMAC secret.
    #[must_use]
    pub fn with_secret(self, kid: impl Into<String>, algorithm: Algorithm, secret: &[u8]) -> Self {
        self.with_key(kid, algorithm, DecodingKey::from_secret(secret))
    }

    /// Build from `jwks.static_keys` configuration entries.
    pub fn from_config(entries: &[StaticKeyConfig]) -> Result<Self, KeyError> {
        let mut keys = Self::new();
        for entry in entries {
            let key = decoding_key_for(entry)?;
            keys = keys.with_key(entry.kid.clone(), entry.alg, key);
        }
        Ok(keys)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// `true` when no keys are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyResolver for StaticKeys {
    fn resolve(&self, header: &Header) -> Result<ResolvedKey, KeyError> {
        let kid = header.kid.as_deref().unwrap_or_default();
        let entry = self
            .keys
            .get(kid)
            .ok_or_else(|| KeyError::KidNotFound(kid.to_string()))?;

        if entry.algorithm != header.alg {
            return Err(KeyError::AlgorithmMismatch {
                kid: kid.to_string(),
                expected: entry.algorithm,
                found: header.alg,
            });
        }

        Ok(ResolvedKey {
            key: entry.key.clone(),
            provider: None,
        })
    }
}

fn decoding_key_for(entry: &StaticKeyConfig) -> Result<DecodingKey, KeyError> {
    let invalid = |reason: String| KeyError::InvalidKey {
        kid: entry.kid.clone(),
        reason,
    };

    match (&entry.secret, &entry.public_key_pem) {
        (Some(secret), None) => {
            if !matches!(entry.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
                return Err(invalid(format!("secret given for non-HMAC algorithm {:?}", entry.alg)));
            }
            Ok(DecodingKey::from_secret(secret.as_bytes()))
        }
        (None, Some(pem)) => {
            let pem = pem.as_bytes();
            let key = match entry.alg {
                Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
                Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
                Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
                other => return Err(invalid(format!("public key given for {other:?}"))),
            };
            key.map_err(|e| invalid(e.to_string()))
        }
        _ => Err(invalid("exactly one of secret or public_key_pem is required".to_string())),
    }
}
