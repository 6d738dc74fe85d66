//! OAuth2 login controller.
//!
//! Serves the routes a browser or API client uses to get a session:
//!
//! | Route | Method | Purpose |
//! |-------|--------|---------|
//! | `base` | GET | Entry page, internal code issuance, redirect when logged in |
//! | `code/{provider}` | GET | Authorization code flow: init and provider callback |
//! | `token/{provider}` | POST | Resource owner password flow |
//! | `info_ui` | GET | Provider list as JSON |
//! | `logout` | GET | Provider end-session call and session removal |
//! | `status` | GET | Popup status page |
//!
//! The code flow binds each `state` twice: to the `auth_state` cookie and to
//! the provider in the ephemeral store. Both are consumed by the callback.

pub mod cookies;
mod page;

use std::sync::Arc;

use axum::{
    Json, Router,
    middleware,
    extract::{Path, Query, State},
    http::{Extensions, HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{LoginConfig, OAuth2Config, RedirectConfig};
use crate::ephemeral::CodeStore;
use crate::oauth::generate_state;
use crate::session::{RouteOptions, Session, append_cookie, cookie_value, host_from_authority, redirect_to_main};
use crate::{Error, Result};

pub use cookies::HelperCookie;

/// Provider info returned by the info route and rendered by the entry page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoResponse {
    /// Page title
    pub title: String,
    /// Providers per flow
    pub provider: InfoProviders,
}

/// Providers grouped by login flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InfoProviders {
    /// Password flow endpoints
    pub password: Vec<Link>,
    /// Code flow endpoints
    pub code: Vec<Link>,
}

/// A provider login endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    /// Display name
    pub name: String,
    /// Endpoint URL
    pub url: String,
    #[serde(skip)]
    pub(crate) priority: i32,
}

#[derive(Debug, Clone)]
struct Paths {
    base: String,
    base_url: String,
    code: String,
    token: String,
    info_ui: String,
    logout: String,
    status: String,
}

impl Paths {
    fn resolve(config: &LoginConfig) -> Self {
        let p = &config.path;
        let base = if p.base.is_empty() { "/login".to_string() } else { p.base.clone() };
        let or_join = |set: &Option<String>, rel: &str| {
            set.clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| join_path(&base, rel))
        };
        Self {
            code: or_join(&p.code, "auth/code"),
            token: or_join(&p.token, "auth/token"),
            info_ui: or_join(&p.info_ui, "auth/info/ui"),
            logout: or_join(&p.logout, "logout"),
            status: or_join(&p.status, "auth/status"),
            base_url: p.base_url.trim_end_matches('/').to_string(),
            base,
        }
    }
}

/// Login controller state.
pub struct Login {
    session: Arc<Session>,
    codes: CodeStore,
    paths: Paths,
    redirect: RedirectConfig,
    title: String,
    state_cookie: HelperCookie,
    success_cookie: HelperCookie,
    white_list: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EntryParams {
    redirect_path: Option<String>,
    response_type: Option<String>,
    redirect_uri: Option<String>,
    state: Option<String>,
    scope: Option<String>,
    auth_info: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CodeParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PasswordRequest {
    username: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    cookie: Option<String>,
}

impl Login {
    /// Controller over a shared session component.
    #[must_use]
    pub fn new(config: &LoginConfig, session: Arc<Session>, codes: CodeStore) -> Self {
        Self {
            session,
            codes,
            paths: Paths::resolve(config),
            redirect: config.redirect.clone(),
            title: config.info.title.clone(),
            state_cookie: HelperCookie::state(&config.state_cookie),
            success_cookie: HelperCookie::success(&config.success_cookie),
            white_list: config.redirect_white_list.clone(),
        }
    }

    /// Internal code store.
    #[must_use]
    pub fn codes(&self) -> &CodeStore {
        &self.codes
    }

    /// Routes of the controller.
    pub fn router(self: Arc<Self>) -> Router {
        let paths = self.paths.clone();
        info!(base = %paths.base, code = %paths.code, token = %paths.token, "Login routes");
        Router::new()
            .route(&paths.base, get(entry))
            .route(&format!("{}/{{provider}}", paths.code.trim_end_matches('/')), get(code_flow))
            .route(&format!("{}/{{provider}}", paths.token.trim_end_matches('/')), post(password_flow))
            .route(&paths.info_ui, get(info_ui))
            .route(&paths.logout, get(logout))
            .route(&paths.status, get(status))
            .layer(middleware::map_request(host_from_authority))
            .with_state(self)
    }

    /// Provider list: hidden providers and providers without OAuth2 are
    /// left out, each flow ordered by priority.
    #[must_use]
    pub fn info(&self) -> InfoResponse {
        let mut providers = InfoProviders::default();
        for (key, provider, _) in self.session.config().oauth2_providers() {
            if provider.hide {
                continue;
            }
            let (list, path) = if provider.password_flow {
                (&mut providers.password, &self.paths.token)
            } else {
                (&mut providers.code, &self.paths.code)
            };
            list.push(Link {
                name: provider.display_name(key).to_string(),
                url: format!("{}{}", self.paths.base_url, join_path(path, key)),
                priority: provider.priority,
            });
        }
        providers.password.sort_by_key(|l| l.priority);
        providers.code.sort_by_key(|l| l.priority);

        InfoResponse {
            title: self.title.clone(),
            provider: providers,
        }
    }

    /// Where the provider sends the browser back to: scheme and host from
    /// the configured base URL, else the forwarded headers, else `Host`.
    pub fn redirect_uri(&self, headers: &HeaderMap, provider: &str) -> Result<String> {
        let origin = if let Some(base) = self.redirect.base_url.as_deref().filter(|b| !b.is_empty()) {
            let url = Url::parse(base).map_err(|e| Error::Config(format!("invalid redirect base_url: {e}")))?;
            let host = url.host_str().unwrap_or_default();
            match url.port() {
                Some(port) => format!("{}://{host}:{port}", url.scheme()),
                None => format!("{}://{host}", url.scheme()),
            }
        } else if let (Some(proto), Some(host)) = (
            header_str(headers, "x-forwarded-proto"),
            header_str(headers, "x-forwarded-host"),
        ) {
            format!("{proto}://{host}")
        } else if let Some(host) = header_str(headers, header::HOST.as_str()) {
            let schema = self.redirect.schema.as_deref().filter(|s| !s.is_empty()).unwrap_or("https");
            format!("{schema}://{host}")
        } else {
            String::new()
        };

        Ok(format!("{origin}{}", join_path(&self.paths.code, provider)))
    }

    fn auth_code_url(&self, headers: &HeaderMap, provider: &str, oauth2: &OAuth2Config, state: &str) -> Result<String> {
        let redirect_uri = self.redirect_uri(headers, provider)?;
        let mut url =
            Url::parse(&oauth2.auth_url).map_err(|e| Error::Config(format!("invalid auth_url of {provider}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("state", state)
                .append_pair("redirect_uri", &redirect_uri)
                .append_pair("client_id", &oauth2.client_id);
            if !oauth2.scopes.is_empty() {
                query.append_pair("scope", &oauth2.scopes.join(" "));
            }
        }
        Ok(url.into())
    }

    async fn entry(&self, headers: &HeaderMap, route: &RouteOptions, params: EntryParams, out: &mut HeaderMap) -> Result<Response> {
        match self.session.is_logged(headers, route, out).await {
            Ok(Some(identity)) => {
                if params.response_type.as_deref() == Some("code") {
                    let alias = identity.claims.alias().unwrap_or_default().to_string();
                    return self.code_return(&alias, &params).await;
                }
                return Ok(redirect_to_main(params.redirect_path.as_deref()));
            }
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "Session on login page is not valid");
                self.session.del_token(headers, route, out).await?;
            }
        }

        if params.auth_info.as_deref().is_some_and(parse_bool) {
            return Ok(Json(self.info()).into_response());
        }

        append_cookie(out, &self.success_cookie.removal())?;
        Ok(Html(page::login_page(&self.info())).into_response())
    }

    /// Hand a logged-in user to a white-listed client with a one-time code.
    async fn code_return(&self, alias: &str, params: &EntryParams) -> Result<Response> {
        let redirect_uri = params.redirect_uri.as_deref().unwrap_or_default();
        if !self.is_valid_redirect_uri(redirect_uri) {
            return Err(Error::Forbidden("redirect_uri is not allowed".to_string()));
        }
        if alias.is_empty() {
            return Err(Error::Forbidden("alias is empty".to_string()));
        }

        let scope = params
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let code = self.codes.code_gen(alias, scope).await?;

        let mut url = Url::parse(redirect_uri).map_err(|e| Error::BadRequest(format!("invalid redirect_uri: {e}")))?;
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("code", &code);
            if let Some(state) = params.state.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("state", state);
            }
        }
        Ok(Redirect::temporary(url.as_str()).into_response())
    }

    fn is_valid_redirect_uri(&self, redirect_uri: &str) -> bool {
        !redirect_uri.is_empty()
            && (self.white_list.is_empty() || self.white_list.iter().any(|p| redirect_uri.starts_with(p.as_str())))
    }

    async fn code_flow(
        &self,
        headers: &HeaderMap,
        route: &RouteOptions,
        provider: &str,
        params: CodeParams,
        out: &mut HeaderMap,
    ) -> Result<Response> {
        let oauth2 = self.session.oauth2(provider)?;

        if let Some(err) = params.error.as_deref() {
            append_cookie(out, &self.state_cookie.removal())?;
            let description = params.error_description.as_deref().unwrap_or_default();
            warn!(provider = %provider, error = %err, description = %description, "Provider returned an error");
            return Err(Error::BadRequest(format!("{err}: {description}")));
        }

        let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
            return self.code_flow_init(headers, provider, oauth2, out).await;
        };

        append_cookie(out, &self.state_cookie.removal())?;
        let state = params.state.as_deref().unwrap_or_default();
        self.check_state(headers, state, provider).await?;

        let redirect_uri = self.redirect_uri(headers, provider)?;
        let raw = self.session.oauth().authorization_code(oauth2, code, &redirect_uri).await?;
        self.session.set_token(headers, route, out, &raw, provider).await?;
        append_cookie(out, &self.success_cookie.build("true"))?;
        info!(provider = %provider, "Code flow login");

        Ok(Html(page::CLOSE_WINDOW).into_response())
    }

    async fn code_flow_init(
        &self,
        headers: &HeaderMap,
        provider: &str,
        oauth2: &OAuth2Config,
        out: &mut HeaderMap,
    ) -> Result<Response> {
        let state = generate_state();
        let location = self.auth_code_url(headers, provider, oauth2, &state)?;
        self.codes.put_state(&state, provider).await?;

        append_cookie(out, &self.success_cookie.removal())?;
        append_cookie(out, &self.state_cookie.build(state))?;
        Ok(Redirect::temporary(&location).into_response())
    }

    /// The query `state` must equal the state cookie and be a live state
    /// issued for this provider.
    async fn check_state(&self, headers: &HeaderMap, state: &str, provider: &str) -> Result<()> {
        let invalid = || Error::Csrf("state is not valid".to_string());

        let cookie = cookie_value(headers, self.state_cookie.name()).unwrap_or_default();
        if cookie.is_empty() || !bool::from(cookie.as_bytes().ct_eq(state.as_bytes())) {
            return Err(invalid());
        }
        match self.codes.take_state(state).await? {
            Some(issued_for) if issued_for == provider => Ok(()),
            _ => Err(invalid()),
        }
    }

    async fn password_flow(
        &self,
        headers: &HeaderMap,
        route: &RouteOptions,
        provider: &str,
        request: PasswordRequest,
        out: &mut HeaderMap,
    ) -> Result<Response> {
        let oauth2 = self.session.oauth2(provider)?;
        if !self.session.provider(provider).is_some_and(|p| p.password_flow) {
            return Err(Error::BadRequest(format!("provider {provider} does not accept the password flow")));
        }

        let raw = self
            .session
            .oauth()
            .password(oauth2, &request.username, &request.password)
            .await?;
        self.session.set_token(headers, route, out, &raw, provider).await?;
        info!(provider = %provider, "Password flow login");

        Ok(StatusCode::NO_CONTENT.into_response())
    }

    async fn logout(&self, headers: &HeaderMap, route: &RouteOptions, out: &mut HeaderMap) -> Result<Response> {
        match self.session.get_token(headers, route).await {
            Ok((stored, oauth2)) if !oauth2.logout_url.is_empty() => {
                if stored.data.id_token.is_empty() {
                    error!(provider = %stored.provider, "Session has no id_token for provider logout");
                } else if let Err(e) = self.session.oauth().logout(oauth2, &stored.data.id_token).await {
                    warn!(provider = %stored.provider, error = %e, "Provider logout failed");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "No token to log out"),
        }

        self.session.del_token(headers, route, out).await?;
        Ok(Redirect::temporary(self.session.login_path()).into_response())
    }
}

async fn entry(
    State(login): State<Arc<Login>>,
    extensions: Extensions,
    headers: HeaderMap,
    Query(params): Query<EntryParams>,
) -> Response {
    let route = route_options(&extensions);
    let mut out = HeaderMap::new();
    let result = login.entry(&headers, &route, params, &mut out).await;
    respond(out, result)
}

async fn code_flow(
    State(login): State<Arc<Login>>,
    Path(provider): Path<String>,
    extensions: Extensions,
    headers: HeaderMap,
    Query(params): Query<CodeParams>,
) -> Response {
    let route = route_options(&extensions);
    let mut out = HeaderMap::new();
    let result = login.code_flow(&headers, &route, &provider, params, &mut out).await;
    respond(out, result)
}

async fn password_flow(
    State(login): State<Arc<Login>>,
    Path(provider): Path<String>,
    extensions: Extensions,
    headers: HeaderMap,
    Json(request): Json<PasswordRequest>,
) -> Response {
    let route = route_options(&extensions);
    let mut out = HeaderMap::new();
    let result = login
        .password_flow(&headers, &route, &provider, request, &mut out)
        .await;
    respond(out, result)
}

async fn info_ui(State(login): State<Arc<Login>>) -> Json<InfoResponse> {
    Json(login.info())
}

async fn logout(State(login): State<Arc<Login>>, extensions: Extensions, headers: HeaderMap) -> Response {
    let route = route_options(&extensions);
    let mut out = HeaderMap::new();
    let result = login.logout(&headers, &route, &mut out).await;
    respond(out, result)
}

async fn status(State(login): State<Arc<Login>>, headers: HeaderMap, Query(params): Query<StatusParams>) -> Html<String> {
    let name = params
        .cookie
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| login.success_cookie.name().to_string());
    let present = cookie_value(&headers, &name).is_some();
    Html(page::status_page(&name, present))
}

fn route_options(extensions: &Extensions) -> RouteOptions {
    extensions.get::<RouteOptions>().cloned().unwrap_or_default()
}

/// Cookies collected in `out` go out with errors too: the state cookie must
/// be cleared even when the callback fails.
fn respond(out: HeaderMap, result: Result<Response>) -> Response {
    let mut response = match result {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "Login request failed");
            e.into_response()
        }
    };
    for (name, value) in &out {
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// `base` and `rel` joined with exactly one slash.
fn join_path(base: &str, rel: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

/// Accepts the spellings `1`, `t`, `true` in any common case.
fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}
