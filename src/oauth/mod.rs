//! OAuth 2.0 provider calls
//!
//! Implements the client side of the grants used by the login flows:
//!
//! - Refresh token grant (session refresh)
//! - Authorization code grant (browser login)
//! - Resource owner password grant (API login)
//! - OIDC end-session call on logout
//!
//! and the random `state` values used for CSRF protection.

mod client;

pub use client::{MAX_RESPONSE_BYTES, OAuth2Client};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};

/// Random CSRF state: 16 bytes, URL-safe base64 without padding.
#[must_use]
pub fn generate_state() -> String {
    let bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_url_safe_and_unique() {
        let a = generate_state();
        let b = generate_state();

        assert_eq!(a.len(), 22);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(a, b);
    }
}
