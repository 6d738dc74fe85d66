//! Configuration management

use std::{collections::BTreeMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::Algorithm;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP listener
    pub server: ServerConfig,
    /// Session component: cookie, store, providers, gate behaviour
    pub session: SessionConfig,
    /// Login flow controller
    pub login: LoginConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // AUTHGATE_SESSION__COOKIE_NAME=... style overrides
        figment = figment.merge(Env::prefixed("AUTHGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in credentials and store addresses.
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for provider in self.session.providers.values_mut() {
            if let Some(oauth2) = provider.oauth2.as_mut() {
                oauth2.client_id = expand_string(&re, &oauth2.client_id);
                oauth2.client_secret = expand_string(&re, &oauth2.client_secret);
            }
        }

        let store = &mut self.session.store;
        if let Some(file) = store.file.as_mut() {
            file.session_key = file.session_key.as_deref().map(|v| expand_string(&re, v));
        }
        if let Some(redis) = store.redis.as_mut() {
            redis.connection.expand(&re);
            redis.session_key = redis.session_key.as_deref().map(|v| expand_string(&re, v));
        }
        if let Some(redis) = self.login.store.redis.as_mut() {
            redis.expand(&re);
        }

        Ok(())
    }

    /// Check the configuration for problems that must abort startup.
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.login.store.active_kind()?;
        if self.login.store.code_ttl.is_zero() || self.login.store.state_ttl.is_zero() {
            return Err(Error::Config("login.store code_ttl and state_ttl must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Session component configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default session cookie name
    pub cookie_name: String,
    /// Per-host cookie name overrides, first match wins
    pub cookie_name_hosts: Vec<HostCookieName>,
    /// Session cookie attributes
    pub options: SessionCookieOptions,
    /// Session persistence backend
    pub store: SessionStoreConfig,
    /// Gate behaviour
    pub action: ActionConfig,
    /// Key resolution
    pub jwks: JwksConfig,
    /// Force this provider name on every verified token
    pub set_provider: Option<String>,
    /// Identity providers by key
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "auth_session".to_string(),
            cookie_name_hosts: Vec::new(),
            options: SessionCookieOptions::default(),
            store: SessionStoreConfig::default(),
            action: ActionConfig::default(),
            jwks: JwksConfig::default(),
            set_provider: None,
            providers: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    /// Providers that have an `oauth2` block, in key order.
    pub fn oauth2_providers(&self) -> impl Iterator<Item = (&str, &ProviderConfig, &OAuth2Config)> {
        self.providers
            .iter()
            .filter_map(|(key, p)| p.oauth2.as_ref().map(|o| (key.as_str(), p, o)))
    }

    fn validate(&self) -> Result<()> {
        if self.oauth2_providers().next().is_none() && self.jwks.static_keys.is_empty() {
            return Err(Error::Config(
                "no active provider: configure at least one provider with an oauth2 block".to_string(),
            ));
        }

        for (key, provider, oauth2) in self.oauth2_providers() {
            let missing = |field: &str| Error::Config(format!("provider {key:?}: oauth2.{field} is required"));
            if oauth2.token_url.is_empty() {
                return Err(missing("token_url"));
            }
            if oauth2.cert_url.is_empty() {
                return Err(missing("cert_url"));
            }
            if !provider.password_flow && oauth2.auth_url.is_empty() {
                return Err(missing("auth_url"));
            }
        }

        for (i, host) in self.cookie_name_hosts.iter().enumerate() {
            if host.cookie_name.is_empty() {
                return Err(Error::Config(format!("cookie_name_hosts[{i}].cookie_name is required")));
            }
            match (&host.host, &host.regex) {
                (_, Some(re)) => {
                    Regex::new(re).map_err(|e| {
                        Error::Config(format!("cookie_name_hosts[{i}].regex invalid: {e}"))
                    })?;
                }
                (Some(_), None) => {}
                (None, None) => {
                    return Err(Error::Config(format!(
                        "cookie_name_hosts[{i}] needs host or regex"
                    )));
                }
            }
        }

        if self.options.max_age <= 0 {
            return Err(Error::Config(format!(
                "session.options.max_age must be positive, got {}",
                self.options.max_age
            )));
        }
        if self.jwks.refresh_interval.is_zero() {
            return Err(Error::Config("session.jwks.refresh_interval must be non-zero".to_string()));
        }
        if self.action.request_timeout.is_zero() {
            return Err(Error::Config("session.action.request_timeout must be non-zero".to_string()));
        }

        if let Some(forced) = &self.set_provider {
            if !self.providers.contains_key(forced) {
                return Err(Error::Config(format!("set_provider {forced:?} is not a configured provider")));
            }
        }

        self.store.active_kind()?;
        Ok(())
    }
}

/// Cookie name override for a host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCookieName {
    /// Exact `Host` header value, e.g. `localhost:8082`
    pub host: Option<String>,
    /// Regex matched against the `Host` header; takes precedence over `host`
    pub regex: Option<String>,
    /// Cookie name to use
    pub cookie_name: String,
}

/// `SameSite` cookie attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    /// `SameSite=Lax`
    Lax,
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=None`
    None,
}

impl From<SameSitePolicy> for cookie::SameSite {
    fn from(value: SameSitePolicy) -> Self {
        match value {
            SameSitePolicy::Lax => Self::Lax,
            SameSitePolicy::Strict => Self::Strict,
            SameSitePolicy::None => Self::None,
        }
    }
}

/// Session cookie attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCookieOptions {
    /// Cookie path
    pub path: String,
    /// Lifetime in seconds, also used as the backend record TTL
    pub max_age: i64,
    /// Cookie domain
    pub domain: Option<String>,
    /// `Secure` flag
    pub secure: bool,
    /// `HttpOnly` flag
    pub http_only: bool,
    /// `SameSite` attribute
    pub same_site: Option<SameSitePolicy>,
}

impl Default for SessionCookieOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            max_age: 86_400,
            domain: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }
}

/// Session backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStoreConfig {
    /// `file`, `redis`, or empty to pick whichever is configured (redis first)
    pub active: String,
    /// File backend
    pub file: Option<FileStoreConfig>,
    /// Redis backend
    pub redis: Option<RedisSessionConfig>,
}

/// Resolved session backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStoreKind {
    /// Files on local disk
    File,
    /// Shared redis
    Redis,
}

impl SessionStoreConfig {
    /// Which backend the configuration selects.
    pub fn active_kind(&self) -> Result<SessionStoreKind> {
        match self.active.as_str() {
            "file" if self.file.is_some() => Ok(SessionStoreKind::File),
            "file" => Err(Error::Config("file store is not configured".to_string())),
            "redis" if self.redis.is_some() => Ok(SessionStoreKind::Redis),
            "redis" => Err(Error::Config("redis store is not configured".to_string())),
            "" if self.redis.is_some() => Ok(SessionStoreKind::Redis),
            "" if self.file.is_some() => Ok(SessionStoreKind::File),
            "" => Err(Error::Config("no session store configured".to_string())),
            other => Err(Error::Config(format!("unknown session store: {other}"))),
        }
    }
}

/// File session backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    /// Directory for session files; the system temp dir when empty
    pub path: String,
    /// Cookie signing key; random per process when absent
    pub session_key: Option<String>,
}

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConnectionConfig {
    /// `host:port`, or a full `redis://` / `rediss://` URL
    pub address: String,
    /// ACL user name
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Connect with TLS (`rediss://`)
    pub tls: bool,
    /// Key prefix
    pub key_prefix: String,
}

impl Default for RedisConnectionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            username: None,
            password: None,
            tls: false,
            key_prefix: String::new(),
        }
    }
}

impl RedisConnectionConfig {
    /// Connection URL for the redis client.
    #[must_use]
    pub fn url(&self) -> String {
        if self.address.starts_with("redis://") || self.address.starts_with("rediss://") {
            return self.address.clone();
        }
        let scheme = if self.tls { "rediss" } else { "redis" };
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };
        format!("{scheme}://{auth}{}", self.address)
    }

    fn expand(&mut self, re: &Regex) {
        self.address = expand_string(re, &self.address);
        self.password = self.password.as_deref().map(|v| expand_string(re, v));
    }
}

/// Redis session backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSessionConfig {
    /// Connection settings
    #[serde(flatten)]
    pub connection: RedisConnectionConfig,
    /// Cookie signing key; random per process when absent
    pub session_key: Option<String>,
}

impl Default for RedisSessionConfig {
    fn default() -> Self {
        Self {
            connection: RedisConnectionConfig {
                key_prefix: "session_".to_string(),
                ..RedisConnectionConfig::default()
            },
            session_key: None,
        }
    }
}

/// Gate behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// Where unauthenticated session requests are redirected
    pub login_path: String,
    /// Never refresh stored tokens
    pub disable_refresh: bool,
    /// Refresh when the access token expires within this window
    #[serde(with = "humantime_serde")]
    pub refresh_lookahead: Duration,
    /// Bound on every provider call (refresh, exchange, logout)
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            login_path: "/login".to_string(),
            disable_refresh: false,
            refresh_lookahead: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Key resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwksConfig {
    /// Background refresh period for provider key sets
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Wake refresh tasks when a key ID is unknown to every provider
    pub refresh_unknown_kid: bool,
    /// Minimum gap between early refreshes
    #[serde(with = "humantime_serde")]
    pub refresh_rate_limit: Duration,
    /// Clock skew tolerance in seconds
    pub leeway: u64,
    /// Fixed keys tried before any provider key set
    pub static_keys: Vec<StaticKeyConfig>,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5 * 60),
            refresh_unknown_kid: false,
            refresh_rate_limit: Duration::from_secs(30),
            leeway: 60,
            static_keys: Vec::new(),
        }
    }
}

/// A fixed verification key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticKeyConfig {
    /// Key ID matched against the token header
    pub kid: String,
    /// Signing algorithm
    #[serde(default)]
    pub alg: Algorithm,
    /// HMAC secret
    #[serde(default)]
    pub secret: Option<String>,
    /// PEM encoded public key
    #[serde(default)]
    pub public_key_pem: Option<String>,
}

/// An identity provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Display name; the provider key when empty
    pub name: Option<String>,
    /// OAuth2 client settings; providers without one are ignored
    pub oauth2: Option<OAuth2Config>,
    /// Claim names tried, in order, for the `X-User` header
    pub x_user: Vec<String>,
    /// Only use `email` for `X-User` when `email_verified` is true
    pub email_verify_check: bool,
    /// Accept the resource-owner password grant
    pub password_flow: bool,
    /// Ordering in the login UI, ascending
    pub priority: i32,
    /// Leave out of the login UI
    pub hide: bool,
}

impl ProviderConfig {
    /// Name shown to users.
    #[must_use]
    pub fn display_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(key)
    }
}

/// How client credentials are sent to the token endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthHeaderStyle {
    /// `Authorization: Basic base64(id:secret)`
    #[default]
    Basic,
    /// `Authorization: Bearer <secret>`
    BearerSecret,
    /// `client_id` and `client_secret` query parameters
    Params,
}

/// OAuth2 client settings of a provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuth2Config {
    /// Client ID
    pub client_id: String,
    /// Client secret
    #[serde(skip_serializing)]
    pub client_secret: String,
    /// Requested scopes
    pub scopes: Vec<String>,
    /// JWKS URL
    pub cert_url: String,
    /// Token introspection endpoint
    pub introspect_url: String,
    /// Authorization endpoint
    pub auth_url: String,
    /// Token endpoint
    pub token_url: String,
    /// End-session endpoint
    pub logout_url: String,
    /// Credential transmission style
    pub auth_header_style: AuthHeaderStyle,
}

/// Login flow controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Route layout
    pub path: LoginPaths,
    /// Redirect URI construction
    pub redirect: RedirectConfig,
    /// Provider info response
    pub info: InfoConfig,
    /// CSRF state cookie
    pub state_cookie: CookieConfig,
    /// Login success cookie; never `HttpOnly`
    pub success_cookie: CookieConfig,
    /// State and code store
    pub store: EphemeralStoreConfig,
    /// Allowed `redirect_uri` prefixes for internal codes; empty allows all
    pub redirect_white_list: Vec<String>,
}

/// Login routes. Unset routes derive from `base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginPaths {
    /// Login entry point
    pub base: String,
    /// Prefix for links in the provider info, e.g. `https://example.com`
    pub base_url: String,
    /// Code flow, `<base>/auth/code` by default
    pub code: Option<String>,
    /// Password flow, `<base>/auth/token` by default
    pub token: Option<String>,
    /// Provider info, `<base>/auth/info/ui` by default
    pub info_ui: Option<String>,
    /// Logout, `<base>/logout` by default
    pub logout: Option<String>,
    /// Popup status page, `<base>/auth/status` by default
    pub status: Option<String>,
}

impl Default for LoginPaths {
    fn default() -> Self {
        Self {
            base: "/login".to_string(),
            base_url: String::new(),
            code: None,
            token: None,
            info_ui: None,
            logout: None,
            status: None,
        }
    }
}

/// Redirect URI construction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Fixed scheme and host for redirect URIs; request headers are used when empty
    pub base_url: Option<String>,
    /// Scheme used with the `Host` header, `https` by default
    pub schema: Option<String>,
}

/// Provider info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoConfig {
    /// Page title
    pub title: String,
}

impl Default for InfoConfig {
    fn default() -> Self {
        Self {
            title: "Login".to_string(),
        }
    }
}

/// Attributes of a login helper cookie. Unset fields take per-cookie defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Cookie name
    pub cookie_name: Option<String>,
    /// Lifetime in seconds
    pub max_age: Option<i64>,
    /// Cookie path
    pub path: Option<String>,
    /// Cookie domain
    pub domain: Option<String>,
    /// `Secure` flag
    pub secure: bool,
    /// `HttpOnly` flag
    pub http_only: Option<bool>,
    /// `SameSite` attribute
    pub same_site: Option<SameSitePolicy>,
}

/// Ephemeral store for CSRF state and internal codes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralStoreConfig {
    /// `memory` (or empty) or `redis`
    pub active: String,
    /// Redis connection
    pub redis: Option<RedisConnectionConfig>,
    /// Lifetime of internal authorization codes
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
    /// Lifetime of CSRF state entries
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
}

impl Default for EphemeralStoreConfig {
    fn default() -> Self {
        Self {
            active: String::new(),
            redis: None,
            code_ttl: Duration::from_secs(10),
            state_ttl: Duration::from_secs(120),
        }
    }
}

/// Resolved ephemeral backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralStoreKind {
    /// Process memory
    Memory,
    /// Shared redis
    Redis,
}

impl EphemeralStoreConfig {
    /// Which backend the configuration selects.
    pub fn active_kind(&self) -> Result<EphemeralStoreKind> {
        match self.active.as_str() {
            "" | "memory" => Ok(EphemeralStoreKind::Memory),
            "redis" if self.redis.is_some() => Ok(EphemeralStoreKind::Redis),
            "redis" => Err(Error::Config("login store redis is not configured".to_string())),
            other => Err(Error::Config(format!("unknown login store: {other}"))),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
