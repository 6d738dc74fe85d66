//! Multi-provider key resolution tests
//!
//! Provider key sets are served by mock JWKS endpoints:
//! - Tokens are tagged with the provider whose set verified them
//! - Unknown key IDs fail with the distinguished error
//! - Refresh swaps keys in, failed refreshes keep the last good set
//! - Unknown key IDs can wake the refresh task

mod common;

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use authgate::jwt::{KeyError, KeyResolver, MultiKeyResolver, ProviderKeySet, StaticKeys, TokenVerifier, VerifyError};

use common::{jwks, now, sign};

const SECRET_A: &[u8] = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const SECRET_B: &[u8] = b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

async fn serve_jwks(server: &MockServer, body: serde_json::Value) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn two_providers() -> (MockServer, MockServer, MultiKeyResolver) {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    serve_jwks(&a, jwks("key-a", SECRET_A)).await;
    serve_jwks(&b, jwks("key-b", SECRET_B)).await;

    let url_a = format!("{}/certs", a.uri());
    let url_b = format!("{}/certs", b.uri());
    let resolver = MultiKeyResolver::connect(
        [("alpha", url_a.as_str()), ("beta", url_b.as_str())],
        None,
        &reqwest::Client::new(),
    )
    .await
    .unwrap();
    (a, b, resolver)
}

#[tokio::test]
async fn token_is_tagged_with_owning_provider() {
    let (_a, _b, resolver) = two_providers().await;
    let verifier = TokenVerifier::new(Arc::new(resolver));

    let token = sign("key-b", SECRET_B, &json!({"sub": "u1", "exp": now() + 300}));
    let verified = verifier.verify(&token).unwrap();

    assert_eq!(verified.provider.as_deref(), Some("beta"));
    assert_eq!(verified.claims.subject(), Some("u1"));
}

#[tokio::test]
async fn unknown_kid_fails_with_not_found_in_sets() {
    let (_a, _b, resolver) = two_providers().await;
    let verifier = TokenVerifier::new(Arc::new(resolver));

    let token = sign("key-z", SECRET_A, &json!({"exp": now() + 300}));
    let err = verifier.verify(&token).unwrap_err();

    assert!(matches!(err, VerifyError::Key(KeyError::KidNotFoundInSets(kid)) if kid == "key-z"));
}

#[tokio::test]
async fn static_keys_are_tried_first_without_provider_tag() {
    let a = MockServer::start().await;
    serve_jwks(&a, jwks("key-a", SECRET_A)).await;
    let url = format!("{}/certs", a.uri());
    let fallback: Arc<dyn KeyResolver> =
        Arc::new(StaticKeys::new().with_secret("static-1", Algorithm::HS256, b"static-secret"));
    let resolver = MultiKeyResolver::connect([("alpha", url.as_str())], Some(fallback), &reqwest::Client::new())
        .await
        .unwrap();
    let verifier = TokenVerifier::new(Arc::new(resolver));

    let from_static = verifier
        .verify(&sign("static-1", b"static-secret", &json!({"exp": now() + 300})))
        .unwrap();
    let from_provider = verifier
        .verify(&sign("key-a", SECRET_A, &json!({"exp": now() + 300})))
        .unwrap();

    assert!(from_static.provider.is_none());
    assert_eq!(from_provider.provider.as_deref(), Some("alpha"));
}

#[tokio::test]
async fn unreachable_jwks_at_startup_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let url = format!("{}/certs", server.uri());

    let result = MultiKeyResolver::connect([("alpha", url.as_str())], None, &reqwest::Client::new()).await;

    assert!(matches!(result, Err(KeyError::Fetch { .. })));
}

#[tokio::test]
async fn refresh_swaps_keys_and_failure_keeps_last_good_set() {
    // GIVEN: a provider set loaded with key-1
    let server = MockServer::start().await;
    serve_jwks(&server, jwks("key-1", SECRET_A)).await;
    let set = ProviderKeySet::fetch("alpha", format!("{}/certs", server.uri()), reqwest::Client::new())
        .await
        .unwrap();
    assert!(set.lookup("key-1").is_some());

    // WHEN: the provider rotates to key-2
    serve_jwks(&server, jwks("key-2", SECRET_B)).await;
    assert_eq!(set.refresh().await.unwrap(), 1);

    // THEN: only key-2 is served, from a fresh snapshot
    assert!(set.lookup("key-1").is_none());
    assert!(set.lookup("key-2").is_some());
    assert_eq!(set.key_count(), 1);
    assert!(set.age() < Duration::from_secs(5));

    // WHEN: the endpoint starts failing
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    // THEN: the refresh fails and key-2 stays in service
    assert!(set.refresh().await.is_err());
    assert!(set.lookup("key-2").is_some());
}

#[tokio::test]
async fn unknown_kid_wakes_background_refresh() {
    // GIVEN: a resolver with refresh on unknown kid and a slow periodic timer
    let server = MockServer::start().await;
    serve_jwks(&server, jwks("key-1", SECRET_A)).await;
    let url = format!("{}/certs", server.uri());
    let resolver = MultiKeyResolver::connect([("alpha", url.as_str())], None, &reqwest::Client::new())
        .await
        .unwrap()
        .with_refresh_unknown_kid(true);
    let (shutdown, _) = tokio::sync::broadcast::channel(1);
    let handles = resolver.spawn_refresh(Duration::from_secs(3600), Duration::ZERO, &shutdown);

    // WHEN: the provider rotates and a token with the new kid shows up
    serve_jwks(&server, jwks("key-2", SECRET_B)).await;
    let token = sign("key-2", SECRET_B, &json!({"exp": now() + 300}));
    let header = jsonwebtoken::decode_header(&token).unwrap();
    assert!(resolver.resolve(&header).is_err());

    // THEN: the key becomes available without waiting for the timer
    let mut found = false;
    for _ in 0..50 {
        if resolver.resolve(&header).is_ok() {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(found);

    let _ = shutdown.send(());
    for handle in handles {
        handle.await.unwrap();
    }
}
