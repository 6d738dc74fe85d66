//! Authentication gateway library
//!
//! Session and token handling for a reverse proxy in front of web apps and
//! APIs, with OAuth2/OIDC identity providers as the source of truth.
//!
//! # Features
//!
//! - **Multi-provider JWT verification**: per-provider JWKS sets refreshed in
//!   the background, tokens tagged with the issuing provider
//! - **Authentication gate**: bearer tokens or cookie sessions, with
//!   transparent refresh of expiring access tokens
//! - **Login controller**: authorization code and password flows, CSRF
//!   state, logout, provider info
//! - **Session stores**: file or redis backends behind one trait
//! - **Ephemeral store**: CSRF state and one-time internal codes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod jwt;
pub mod login;
pub mod oauth;
pub mod server;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
