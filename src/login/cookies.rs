//! CSRF state and login success cookies.

use cookie::{Cookie, SameSite};

use crate::config::CookieConfig;

/// A login helper cookie with its defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCookie {
    name: String,
    max_age: i64,
    path: String,
    domain: Option<String>,
    secure: bool,
    http_only: bool,
    same_site: SameSite,
}

impl HelperCookie {
    /// `auth_state`, 360 seconds, `HttpOnly` unless configured otherwise.
    #[must_use]
    pub fn state(config: &CookieConfig) -> Self {
        Self::with_defaults(config, "auth_state", 360, config.http_only.unwrap_or(true))
    }

    /// `auth_verify`, 60 seconds, never `HttpOnly`: page scripts poll it.
    #[must_use]
    pub fn success(config: &CookieConfig) -> Self {
        Self::with_defaults(config, "auth_verify", 60, false)
    }

    fn with_defaults(config: &CookieConfig, name: &str, max_age: i64, http_only: bool) -> Self {
        Self {
            name: config
                .cookie_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| name.to_string()),
            max_age: config.max_age.filter(|v| *v != 0).unwrap_or(max_age),
            path: config
                .path
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "/".to_string()),
            domain: config.domain.clone(),
            secure: config.secure,
            http_only,
            same_site: config.same_site.map_or(SameSite::Lax, Into::into),
        }
    }

    /// Cookie name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cookie carrying `value`.
    #[must_use]
    pub fn build(&self, value: impl Into<String>) -> Cookie<'static> {
        self.make(value.into(), self.max_age)
    }

    /// A cookie that clears this one.
    #[must_use]
    pub fn removal(&self) -> Cookie<'static> {
        self.make(String::new(), 0)
    }

    fn make(&self, value: String, max_age: i64) -> Cookie<'static> {
        let mut builder = Cookie::build((self.name.clone(), value))
            .path(self.path.clone())
            .max_age(cookie::time::Duration::seconds(max_age))
            .secure(self.secure)
            .http_only(self.http_only)
            .same_site(self.same_site);
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cookie_defaults() {
        let cookie = HelperCookie::state(&CookieConfig::default()).build("S1");

        assert_eq!(cookie.name(), "auth_state");
        assert_eq!(cookie.value(), "S1");
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::seconds(360)));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.http_only(), Some(true));
    }

    #[test]
    fn success_cookie_is_never_http_only() {
        let config = CookieConfig {
            http_only: Some(true),
            ..CookieConfig::default()
        };
        let cookie = HelperCookie::success(&config).build("true");

        assert_eq!(cookie.name(), "auth_verify");
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::seconds(60)));
        assert_eq!(cookie.http_only(), Some(false));
    }

    #[test]
    fn removal_expires_immediately() {
        let cookie = HelperCookie::state(&CookieConfig::default()).removal();

        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::ZERO));
    }
}
