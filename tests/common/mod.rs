//! Shared fixtures: a mocked identity provider and a gateway wired to it.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, header};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use authgate::config::{Config, FileStoreConfig, OAuth2Config, ProviderConfig};
use authgate::server::Gateway;
use authgate::session::{RouteOptions, Session};

pub const KID: &str = "kc-key-1";
pub const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";
pub const HOST: &str = "gate.local";

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn jwks(kid: &str, secret: &[u8]) -> Value {
    json!({"keys": [{
        "kty": "oct",
        "kid": kid,
        "alg": "HS256",
        "k": URL_SAFE_NO_PAD.encode(secret),
    }]})
}

pub fn sign(kid: &str, secret: &[u8], claims: &Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
}

/// Access token for `alice` signed with the provider key, expiring in `ttl` seconds.
pub fn access_token(ttl: i64) -> String {
    sign(
        KID,
        SECRET,
        &json!({
            "sub": "u-1",
            "preferred_username": "alice",
            "email": "alice@example.com",
            "scope": "openid profile",
            "realm_access": {"roles": ["admin"]},
            "typ": "Bearer",
            "exp": now() + ttl,
        }),
    )
}

pub fn token_response(access_token: &str, refresh_token: &str) -> Value {
    json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "token_type": "Bearer",
        "expires_in": 300,
        "id_token": "id-token-1",
        "scope": "openid profile",
    })
}

pub struct Harness {
    pub app: Router,
    pub session: Arc<Session>,
    pub idp: MockServer,
    _dir: TempDir,
}

/// Provider `kc` served by a mock server, file sessions in a temp dir.
pub async fn harness(customize: impl FnOnce(&mut Config)) -> Harness {
    let idp = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks(KID, SECRET)))
        .mount(&idp)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.session.store.active = "file".to_string();
    config.session.store.file = Some(FileStoreConfig {
        path: dir.path().display().to_string(),
        session_key: Some("integration-session-key".to_string()),
    });
    config.session.providers.insert(
        "kc".to_string(),
        ProviderConfig {
            name: Some("Keycloak".to_string()),
            oauth2: Some(OAuth2Config {
                client_id: "gate".to_string(),
                client_secret: "gate-secret".to_string(),
                scopes: vec!["openid".to_string()],
                cert_url: format!("{}/certs", idp.uri()),
                auth_url: format!("{}/auth", idp.uri()),
                token_url: format!("{}/token", idp.uri()),
                logout_url: format!("{}/logout", idp.uri()),
                ..OAuth2Config::default()
            }),
            x_user: vec!["preferred_username".to_string()],
            ..ProviderConfig::default()
        },
    );
    customize(&mut config);
    config.validate().unwrap();

    let gateway = Gateway::new(config).await.unwrap();
    Harness {
        app: gateway.router(),
        session: Arc::clone(gateway.session()),
        idp,
        _dir: dir,
    }
}

/// Store a token response for provider `kc` and return the session cookie pair.
pub async fn establish_session(h: &Harness, raw: &Value) -> String {
    let mut out = HeaderMap::new();
    h.session
        .set_token(&HeaderMap::new(), &RouteOptions::default(), &mut out, raw.to_string().as_bytes(), "kc")
        .await
        .unwrap();
    let cookie = set_cookies_in(&out).pop().unwrap();
    format!("{}={}", cookie.name(), cookie.value())
}

pub fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("GET").uri(uri).header(header::HOST, HOST)
}

pub fn empty(builder: axum::http::request::Builder) -> Request<Body> {
    builder.body(Body::empty()).unwrap()
}

/// `Set-Cookie` values of a response, parsed.
pub fn set_cookies<B>(response: &Response<B>) -> Vec<cookie::Cookie<'static>> {
    set_cookies_in(response.headers())
}

pub fn set_cookies_in(headers: &HeaderMap) -> Vec<cookie::Cookie<'static>> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| cookie::Cookie::parse(v.to_str().unwrap().to_string()).unwrap())
        .collect()
}

/// The last cookie named `name` set by a response.
pub fn find_cookie<B>(response: &Response<B>, name: &str) -> Option<cookie::Cookie<'static>> {
    set_cookies(response).into_iter().rev().find(|c| c.name() == name)
}

pub fn location<B>(response: &Response<B>) -> String {
    response.headers()[header::LOCATION].to_str().unwrap().to_string()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
