//! The Session component.
//!
//! Owns everything request handlers need to authenticate a caller: the
//! session store, the token verifier, the provider table and the OAuth2
//! client used for refresh grants. The gate middleware and the login
//! controller both receive a shared `Arc<Session>`.
//!
//! Session contents are two values: `token`, the provider's token response
//! as standard base64, and `provider`, the key of the issuing provider.

pub mod gate;
pub mod store;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Uri, header};
use axum::response::{IntoResponse, Redirect, Response};
use bytes::Bytes;
use cookie::Cookie;
use regex::Regex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{OAuth2Config, ProviderConfig, SessionConfig};
use crate::jwt::{Claims, KeyResolver, MultiKeyResolver, StaticKeys, TokenVerifier, VerifiedToken, VerifyError};
use crate::oauth::OAuth2Client;
use crate::{Error, Result};

pub use gate::session_gate;
pub use store::{SessionBackend, SessionState, SessionStore, SessionValues};
pub use token::{StoredToken, TokenData};

/// Session value holding the encoded token response.
pub const TOKEN_KEY: &str = "token";
/// Session value holding the provider key.
pub const PROVIDER_KEY: &str = "provider";

/// Set on responses that wrote a session token.
pub const SESSION_SET_HEADER: HeaderName = HeaderName::from_static("x-session-set");
/// Identity header forwarded to downstream handlers.
pub const X_USER_HEADER: HeaderName = HeaderName::from_static("x-user");

const SESSION_REAP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Copy the URI authority into `Host` when the header is missing, as it is
/// on HTTP/2 where the host arrives as `:authority`.
pub fn fill_host(request: &mut Request<Body>) {
    if request.headers().contains_key(header::HOST) {
        return;
    }
    let Some(value) = request
        .uri()
        .authority()
        .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    else {
        return;
    };
    request.headers_mut().insert(header::HOST, value);
}

/// [`fill_host`] for `axum::middleware::map_request`.
pub async fn host_from_authority(mut request: Request<Body>) -> Request<Body> {
    fill_host(&mut request);
    request
}

/// Per-route gate behaviour, attached as a request extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOptions {
    /// Put the session's access token into `Authorization: Bearer`.
    pub token_header: bool,
    /// Remove `Authorization` before the request continues.
    pub token_header_delete: bool,
    /// Answer 407 instead of redirecting to the login page.
    pub disable_redirect: bool,
    /// Use this session cookie name regardless of host.
    pub cookie_name: Option<String>,
}

/// Verified caller, attached as a request extension by the gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    /// Verified token claims
    pub claims: Claims,
    /// Provider that issued the token; empty when unknown
    pub provider: String,
}

/// Outcome of loading a session whose token verified.
#[derive(Debug, Clone)]
pub struct ValidSession {
    /// Caller identity
    pub identity: Identity,
    /// Access token that verified, after any refresh
    pub access_token: String,
}

enum HostMatcher {
    Exact(String),
    Pattern(Regex),
}

struct CookieNameRule {
    matcher: HostMatcher,
    cookie_name: String,
}

impl CookieNameRule {
    fn matches(&self, host: &str) -> bool {
        match &self.matcher {
            HostMatcher::Exact(h) => h == host,
            HostMatcher::Pattern(re) => re.is_match(host),
        }
    }
}

/// Shared authentication state.
pub struct Session {
    config: SessionConfig,
    cookie_rules: Vec<CookieNameRule>,
    store: SessionStore,
    verifier: TokenVerifier,
    oauth: OAuth2Client,
    key_sets: Option<Arc<MultiKeyResolver>>,
}

impl Session {
    /// Assemble a session component from ready parts.
    pub fn new(config: SessionConfig, store: SessionStore, verifier: TokenVerifier, oauth: OAuth2Client) -> Result<Self> {
        let cookie_rules = compile_cookie_rules(&config)?;
        Ok(Self {
            config,
            cookie_rules,
            store,
            verifier,
            oauth,
            key_sets: None,
        })
    }

    /// Build from configuration: fetch every provider key set, open the
    /// session store and prepare the OAuth2 client.
    pub async fn from_config(config: SessionConfig) -> Result<Self> {
        let oauth = OAuth2Client::new(config.action.request_timeout)?;

        let fallback: Option<Arc<dyn KeyResolver>> = if config.jwks.static_keys.is_empty() {
            None
        } else {
            let keys = StaticKeys::from_config(&config.jwks.static_keys)
                .map_err(|e| Error::Config(format!("static key: {e}")))?;
            Some(Arc::new(keys))
        };

        let providers = config
            .oauth2_providers()
            .map(|(key, _, oauth2)| (key, oauth2.cert_url.as_str()));
        let resolver = MultiKeyResolver::connect(providers, fallback, oauth.http())
            .await
            .map_err(|e| Error::Config(format!("cannot create key resolver: {e}")))?
            .with_refresh_unknown_kid(config.jwks.refresh_unknown_kid);
        let resolver = Arc::new(resolver);
        info!(providers = resolver.sets().len(), "Provider key sets loaded");

        let verifier = TokenVerifier::new(resolver.clone()).with_leeway(config.jwks.leeway);
        let store = SessionStore::from_config(&config.store, config.options.clone()).await?;
        info!(backend = store.backend().name(), "Session store ready");

        let mut session = Self::new(config, store, verifier, oauth)?;
        session.key_sets = Some(resolver);
        Ok(session)
    }

    /// Start key set refresh and session reaping; all stop on `shutdown`.
    pub fn spawn_background(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = match &self.key_sets {
            Some(resolver) => resolver.spawn_refresh(
                self.config.jwks.refresh_interval,
                self.config.jwks.refresh_rate_limit,
                shutdown,
            ),
            None => Vec::new(),
        };
        handles.push(store::spawn_reaper(
            self.store.backend().clone(),
            SESSION_REAP_INTERVAL,
            shutdown.subscribe(),
        ));
        handles
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Provider client.
    #[must_use]
    pub fn oauth(&self) -> &OAuth2Client {
        &self.oauth
    }

    /// Provider by key.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.config.providers.get(name)
    }

    /// OAuth2 settings of a provider.
    pub fn oauth2(&self, name: &str) -> Result<&OAuth2Config> {
        self.provider(name)
            .and_then(|p| p.oauth2.as_ref())
            .ok_or_else(|| Error::ProviderNotFound(name.to_string()))
    }

    /// Cookie name for this request: the route override, then the first
    /// matching host rule, then the default.
    #[must_use]
    pub fn cookie_name<'a>(&'a self, headers: &HeaderMap, route: &'a RouteOptions) -> &'a str {
        if let Some(name) = route.cookie_name.as_deref().filter(|n| !n.is_empty()) {
            return name;
        }
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        self.cookie_rules
            .iter()
            .find(|rule| rule.matches(host))
            .map_or(self.config.cookie_name.as_str(), |rule| rule.cookie_name.as_str())
    }

    /// Verify a bearer token. Refresh and ID tokens are refused.
    pub fn verify_bearer(&self, token: &str) -> Result<Identity> {
        let verified = self.verifier.verify(token)?;
        if let Some(typ @ ("Refresh" | "ID")) = verified.claims.token_type() {
            return Err(VerifyError::WrongType(typ.to_string()).into());
        }
        Ok(self.identity(verified, None))
    }

    /// Identity for the `X-User` header per the provider's claim list.
    #[must_use]
    pub fn x_user<'c>(&self, identity: &'c Identity) -> Option<&'c str> {
        match self.provider(&identity.provider) {
            Some(p) => identity.claims.x_user(&p.x_user, p.email_verify_check),
            None => identity.claims.x_user(&[], false),
        }
    }

    /// Load the caller's session and verify its token, refreshing it first
    /// when it is about to expire. `Ok(None)` means there is no session.
    ///
    /// Cookies written by a refresh are appended to `out`.
    pub async fn load_validated(
        &self,
        headers: &HeaderMap,
        route: &RouteOptions,
        out: &mut HeaderMap,
    ) -> Result<Option<ValidSession>> {
        let cookie_name = self.cookie_name(headers, route);
        let state = match self.store.get(cookie_value(headers, cookie_name).as_deref()).await {
            Ok(state) if !state.is_new => state,
            Ok(_) => return Ok(None),
            Err(e) => {
                error!(error = %e, "Cannot read session");
                return Ok(None);
            }
        };

        let provider = self
            .config
            .set_provider
            .clone()
            .or_else(|| state.values.get(PROVIDER_KEY).cloned())
            .unwrap_or_default();
        let encoded = state.values.get(TOKEN_KEY).ok_or(Error::SessionNotFound)?;
        let mut data = TokenData::parse(&token::decode_stored(encoded)?)?;

        if !self.config.action.disable_refresh
            && token::is_refresh_needed(&data.access_token, self.config.action.refresh_lookahead)?
        {
            debug!(provider = %provider, "Access token due for refresh");
            let refreshed = self.refresh(&data, &provider).await?;
            self.write_token(cookie_name, state.id.clone(), out, &refreshed, &provider)
                .await?;
            data = TokenData::parse(&refreshed)?;
        }

        let verified = self.verifier.verify(&data.access_token)?;
        Ok(Some(ValidSession {
            identity: self.identity(verified, Some(&provider)),
            access_token: data.access_token,
        }))
    }

    /// Claims of a logged-in caller, `None` when there is no session.
    pub async fn is_logged(
        &self,
        headers: &HeaderMap,
        route: &RouteOptions,
        out: &mut HeaderMap,
    ) -> Result<Option<Identity>> {
        Ok(self
            .load_validated(headers, route, out)
            .await?
            .map(|valid| valid.identity))
    }

    /// Store a token response in the caller's session, creating it when
    /// missing.
    pub async fn set_token(
        &self,
        headers: &HeaderMap,
        route: &RouteOptions,
        out: &mut HeaderMap,
        raw: &[u8],
        provider: &str,
    ) -> Result<()> {
        let cookie_name = self.cookie_name(headers, route);
        let state = self.store.get(cookie_value(headers, cookie_name).as_deref()).await?;
        self.write_token(cookie_name, state.id, out, raw, provider).await
    }

    /// The stored token and its provider's OAuth2 settings.
    pub async fn get_token(&self, headers: &HeaderMap, route: &RouteOptions) -> Result<(StoredToken, &OAuth2Config)> {
        let cookie_name = self.cookie_name(headers, route);
        let state = self.store.get(cookie_value(headers, cookie_name).as_deref()).await?;
        if state.is_new {
            return Err(Error::SessionNotFound);
        }

        let encoded = state.values.get(TOKEN_KEY).ok_or(Error::SessionNotFound)?;
        let raw = token::decode_stored(encoded)?;
        let data = TokenData::parse(&raw)?;
        let provider = state.values.get(PROVIDER_KEY).cloned().unwrap_or_default();
        let oauth2 = self.oauth2(&provider)?;

        Ok((StoredToken { raw, data, provider }, oauth2))
    }

    /// Remove the caller's session and expire its cookie.
    pub async fn del_token(&self, headers: &HeaderMap, route: &RouteOptions, out: &mut HeaderMap) -> Result<()> {
        let cookie_name = self.cookie_name(headers, route);
        let cookie = match self.store.get(cookie_value(headers, cookie_name).as_deref()).await {
            Ok(state) if !state.is_new => self.store.delete(cookie_name, &state.id).await?,
            Ok(_) => self.store.removal_cookie(cookie_name),
            Err(e) => {
                error!(error = %e, "Cannot read session for removal");
                self.store.removal_cookie(cookie_name)
            }
        };
        append_cookie(out, &cookie)
    }

    /// 307 to the login path carrying the original path and query.
    #[must_use]
    pub fn login_redirect(&self, uri: &Uri) -> Response {
        Redirect::temporary(&login_location(&self.config.action.login_path, uri)).into_response()
    }

    /// Login path without any `redirect_path`.
    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.config.action.login_path
    }

    async fn refresh(&self, data: &TokenData, provider: &str) -> Result<Bytes> {
        let oauth2 = self.oauth2(provider)?;
        if data.refresh_token.is_empty() {
            return Err(Error::Refresh("session has no refresh token".to_string()));
        }
        self.oauth
            .refresh_token(oauth2, &data.refresh_token, &data.scopes())
            .await
            .map_err(|e| Error::Refresh(e.to_string()))
    }

    async fn write_token(
        &self,
        cookie_name: &str,
        id: String,
        out: &mut HeaderMap,
        raw: &[u8],
        provider: &str,
    ) -> Result<()> {
        let mut values = SessionValues::new();
        values.insert(TOKEN_KEY.to_string(), token::encode_stored(raw));
        values.insert(PROVIDER_KEY.to_string(), provider.to_string());
        let state = SessionState {
            id,
            is_new: false,
            values,
        };

        let cookie = self.store.save(cookie_name, &state).await?;
        append_cookie(out, &cookie)?;
        out.insert(SESSION_SET_HEADER, HeaderValue::from_static("true"));
        Ok(())
    }

    fn identity(&self, verified: VerifiedToken, stored_provider: Option<&str>) -> Identity {
        let provider = self
            .config
            .set_provider
            .clone()
            .or(verified.provider)
            .or_else(|| stored_provider.map(str::to_string))
            .unwrap_or_default();
        Identity {
            claims: verified.claims,
            provider,
        }
    }
}

fn compile_cookie_rules(config: &SessionConfig) -> Result<Vec<CookieNameRule>> {
    config
        .cookie_name_hosts
        .iter()
        .enumerate()
        .map(|(i, host)| {
            let matcher = match (&host.regex, &host.host) {
                (Some(re), _) => HostMatcher::Pattern(
                    Regex::new(re).map_err(|e| Error::Config(format!("cookie_name_hosts[{i}].regex invalid: {e}")))?,
                ),
                (None, Some(h)) => HostMatcher::Exact(h.clone()),
                (None, None) => {
                    return Err(Error::Config(format!("cookie_name_hosts[{i}] needs host or regex")));
                }
            };
            Ok(CookieNameRule {
                matcher,
                cookie_name: host.cookie_name.clone(),
            })
        })
        .collect()
}

/// Value of the named request cookie.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(std::result::Result::ok)
        .find(|c| c.name() == name)
        .map(|c| c.value().to_string())
}

/// Append a `Set-Cookie` header.
pub fn append_cookie(out: &mut HeaderMap, cookie: &Cookie<'_>) -> Result<()> {
    let value = HeaderValue::from_str(&cookie.to_string())
        .map_err(|e| Error::Internal(format!("invalid Set-Cookie value: {e}")))?;
    out.append(header::SET_COOKIE, value);
    Ok(())
}

/// `login_path?redirect_path=<path?query>`; the parameter is left out for
/// the site root.
#[must_use]
pub fn login_location(login_path: &str, uri: &Uri) -> String {
    let path = uri.path();
    let query = uri.query().unwrap_or_default();
    if (path.is_empty() || path == "/") && query.is_empty() {
        return login_path.to_string();
    }

    let target = if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    };
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
    format!("{login_path}?redirect_path={encoded}")
}

/// 307 to `redirect_path` when it is a local path, else to `/`.
#[must_use]
pub fn redirect_to_main(redirect_path: Option<&str>) -> Response {
    let target = redirect_path
        .filter(|p| p.starts_with('/') && !p.starts_with("//") && !p.starts_with("/\\"))
        .unwrap_or("/");
    Redirect::temporary(target).into_response()
}
