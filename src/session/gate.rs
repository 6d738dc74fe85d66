//! Authentication gate middleware.
//!
//! Runs in front of protected routes:
//!
//! 1. `Authorization: Bearer <token>` is verified on its own. Failure is a
//!    407 and never touches the session.
//! 2. Otherwise the session cookie is loaded, refreshed when the access
//!    token is about to expire, and verified. A missing session redirects to
//!    the login page; any other failure also removes the session.
//!
//! On success the caller's [`Identity`] is inserted as a request extension
//! and `X-User` is rewritten from the claims.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, header},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error};

use super::{Identity, RouteOptions, Session, X_USER_HEADER, fill_host};
use crate::error::auth_required_response;

/// Gate middleware; use with `axum::middleware::from_fn_with_state`.
pub async fn session_gate(State(session): State<Arc<Session>>, mut request: Request<Body>, next: Next) -> Response {
    fill_host(&mut request);
    let route = request
        .extensions()
        .get::<RouteOptions>()
        .cloned()
        .unwrap_or_default();

    if let Some(token) = bearer_token(request.headers()) {
        let identity = match session.verify_bearer(token) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(error = %e, "Bearer token rejected");
                return auth_required_response();
            }
        };

        attach_identity(&session, &mut request, identity);
        if route.token_header_delete {
            request.headers_mut().remove(header::AUTHORIZATION);
        }
        return next.run(request).await;
    }

    let mut set_headers = HeaderMap::new();
    match session
        .load_validated(request.headers(), &route, &mut set_headers)
        .await
    {
        Ok(Some(valid)) => {
            attach_identity(&session, &mut request, valid.identity);

            if route.token_header {
                match HeaderValue::from_str(&format!("Bearer {}", valid.access_token)) {
                    Ok(v) => {
                        request.headers_mut().insert(header::AUTHORIZATION, v);
                    }
                    Err(e) => error!(error = %e, "Access token is not a valid header value"),
                }
            }
            if route.token_header_delete {
                request.headers_mut().remove(header::AUTHORIZATION);
            }

            let mut response = next.run(request).await;
            merge_headers(&mut response, &set_headers);
            response
        }
        Ok(None) => {
            debug!(path = %request.uri().path(), "No session");
            deny(&session, &request, &route, &set_headers)
        }
        Err(e) => {
            debug!(error = %e, "Session rejected");
            let mut clear = HeaderMap::new();
            if let Err(e) = session.del_token(request.headers(), &route, &mut clear).await {
                error!(error = %e, "Cannot remove session");
            }
            deny(&session, &request, &route, &clear)
        }
    }
}

/// Token of an `Authorization: Bearer <token>` header; empty tokens and
/// other schemes fall through to the session path.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn attach_identity(session: &Session, request: &mut Request<Body>, identity: Identity) {
    let x_user = session
        .x_user(&identity)
        .and_then(|v| HeaderValue::from_str(v).ok());

    let headers = request.headers_mut();
    headers.remove(X_USER_HEADER);
    if let Some(v) = x_user {
        headers.insert(X_USER_HEADER, v);
    }
    request.extensions_mut().insert(identity);
}

fn deny(session: &Session, request: &Request<Body>, route: &RouteOptions, set_headers: &HeaderMap) -> Response {
    let mut response = if route.disable_redirect {
        auth_required_response()
    } else {
        session.login_redirect(request.uri())
    };
    merge_headers(&mut response, set_headers);
    response
}

fn merge_headers(response: &mut Response, extra: &HeaderMap) {
    for (name, value) in extra {
        response.headers_mut().append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn bearer_token_extraction() {
        assert_eq!(bearer_token(&auth("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&auth("Bearer ")), None);
        assert_eq!(bearer_token(&auth("Basic dXNlcjpwYXNz")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
