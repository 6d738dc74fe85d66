//! Token endpoint data as stored in sessions.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize};

use crate::jwt::{VerifyError, unverified_claims};
use crate::{Error, Result};

/// OAuth2 token endpoint response.
///
/// Sessions keep the raw response bytes; this is the parsed view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    /// Access token (a JWT for the providers we talk to)
    #[serde(default)]
    pub access_token: String,
    /// Access token lifetime in seconds
    #[serde(default, deserialize_with = "lenient_i64")]
    pub expires_in: i64,
    /// Refresh token lifetime in seconds
    #[serde(default, deserialize_with = "lenient_i64")]
    pub refresh_expires_in: i64,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: String,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: String,
    /// Keycloak revocation policy marker
    #[serde(default, rename = "not-before-policy", deserialize_with = "lenient_i64")]
    pub not_before_policy: i64,
    /// Provider session ID
    #[serde(default)]
    pub session_state: String,
    /// Granted scopes, space separated
    #[serde(default)]
    pub scope: String,
    /// OIDC ID token
    #[serde(default)]
    pub id_token: String,
}

impl TokenData {
    /// Parse a token endpoint response body.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Granted scopes.
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        self.scope.split_whitespace().collect()
    }
}

/// Session-held form of a token: standard base64 of the raw response bytes.
#[must_use]
pub fn encode_stored(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}

/// Inverse of [`encode_stored`].
pub fn decode_stored(value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::Store(format!("stored token is not valid base64: {e}")))
}

/// A token loaded from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    /// Exact bytes returned by the provider
    pub raw: Vec<u8>,
    /// Parsed view of `raw`
    pub data: TokenData,
    /// Provider that issued the token
    pub provider: String,
}

/// `true` when the access token expires within `lookahead` from now.
///
/// The token is only decoded, not verified.
pub fn is_refresh_needed(access_token: &str, lookahead: Duration) -> std::result::Result<bool, VerifyError> {
    is_refresh_needed_at(access_token, lookahead, chrono::Utc::now().timestamp())
}

/// [`is_refresh_needed`] against an explicit clock. A token whose remaining
/// lifetime equals the window exactly is due.
pub fn is_refresh_needed_at(
    access_token: &str,
    lookahead: Duration,
    now: i64,
) -> std::result::Result<bool, VerifyError> {
    let exp = unverified_claims(access_token)?
        .expires_at()
        .ok_or_else(|| VerifyError::Malformed("access token has no exp claim".to_string()))?;
    let window = i64::try_from(lookahead.as_secs()).unwrap_or(i64::MAX);
    Ok(exp.saturating_sub(now) <= window)
}

/// Accept numbers, numeric strings and null.
#[allow(clippy::cast_possible_truncation)]
fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Int(i64),
        Float(f64),
        Text(String),
        Null,
    }

    match Lenient::deserialize(deserializer)? {
        Lenient::Int(v) => Ok(v),
        Lenient::Float(v) => Ok(v as i64),
        Lenient::Text(s) if s.is_empty() => Ok(0),
        Lenient::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Lenient::Null => Ok(0),
    }
}
