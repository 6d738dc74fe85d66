//! Per-provider JWKS caches and the multi-provider resolver.
//!
//! # Refresh model
//!
//! Each [`ProviderKeySet`] publishes its keys as an immutable snapshot behind
//! an [`ArcSwap`]. Verification loads the current snapshot without locking;
//! a background task per provider fetches the JWKS on a timer and swaps in a
//! new snapshot only after a successful fetch, so a failing endpoint keeps the
//! last known good keys in service.
//!
//! A miss in every provider can optionally wake the refresh tasks (rate
//! limited); the verification that missed still fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use jsonwebtoken::{DecodingKey, Header, jwk::Jwk};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::keys::{KeyError, KeyResolver, ResolvedKey};

/// Default interval between background JWKS fetches.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Keys published by one fetch.
struct Snapshot {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

impl Snapshot {
    fn from_document(doc: &serde_json::Value) -> Self {
        let mut keys = HashMap::new();
        let entries = doc
            .get("keys")
            .and_then(serde_json::Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for entry in entries {
            let jwk: Jwk = match serde_json::from_value(entry.clone()) {
                Ok(jwk) => jwk,
                Err(e) => {
                    debug!(error = %e, "Skipping unparseable JWK");
                    continue;
                }
            };
            let Some(kid) = jwk.common.key_id.clone() else {
                debug!("Skipping JWK without kid");
                continue;
            };
            match DecodingKey::from_jwk(&jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => debug!(kid = %kid, error = %e, "Skipping unusable JWK"),
            }
        }

        Self {
            keys,
            fetched_at: Instant::now(),
        }
    }
}

/// Auto-refreshing key set of a single provider.
pub struct ProviderKeySet {
    name: String,
    cert_url: String,
    http: reqwest::Client,
    snapshot: ArcSwap<Snapshot>,
    refresh_requested: Notify,
}

impl ProviderKeySet {
    /// Fetch the provider's JWKS once and build the key set.
    ///
    /// An unreachable or malformed JWKS at this point is an error; later
    /// refresh failures are only logged.
    pub async fn fetch(
        name: impl Into<String>,
        cert_url: impl Into<String>,
        http: reqwest::Client,
    ) -> Result<Arc<Self>, KeyError> {
        let name = name.into();
        let cert_url = cert_url.into();
        if cert_url.is_empty() {
            return Err(KeyError::MissingCertUrl(name));
        }

        let doc = fetch_document(&http, &cert_url).await?;
        let snapshot = Snapshot::from_document(&doc);
        info!(provider = %name, keys = snapshot.keys.len(), "Loaded JWKS");

        Ok(Arc::new(Self {
            name,
            cert_url,
            http,
            snapshot: ArcSwap::from_pointee(snapshot),
            refresh_requested: Notify::new(),
        }))
    }

    /// Provider name this set belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of keys in the current snapshot.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.snapshot.load().keys.len()
    }

    /// Time since the current snapshot was fetched.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.snapshot.load().fetched_at.elapsed()
    }

    /// Look up a key in the current snapshot.
    #[must_use]
    pub fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        self.snapshot.load().keys.get(kid).cloned()
    }

    /// Fetch the JWKS now and publish it. On failure the previous snapshot
    /// stays in place.
    pub async fn refresh(&self) -> Result<usize, KeyError> {
        let doc = fetch_document(&self.http, &self.cert_url).await?;
        let snapshot = Snapshot::from_document(&doc);
        let count = snapshot.keys.len();
        self.snapshot.store(Arc::new(snapshot));
        Ok(count)
    }

    /// Wake the background task for an early refresh.
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Spawn the periodic refresh task. Early refreshes requested through
    /// [`request_refresh`](Self::request_refresh) are honoured at most once
    /// per `rate_limit`.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        rate_limit: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let set = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the initial fetch already happened.
            ticker.tick().await;
            let mut last_refresh = Instant::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = set.refresh_requested.notified() => {
                        if last_refresh.elapsed() < rate_limit {
                            debug!(provider = %set.name, "Early JWKS refresh suppressed by rate limit");
                            continue;
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!(provider = %set.name, "JWKS refresh task shutting down");
                        break;
                    }
                }

                last_refresh = Instant::now();
                match set.refresh().await {
                    Ok(count) => debug!(provider = %set.name, keys = count, "Refreshed JWKS"),
                    Err(e) => warn!(provider = %set.name, error = %e, "Failed to refresh JWKS"),
                }
            }
        })
    }
}

async fn fetch_document(http: &reqwest::Client, url: &str) -> Result<serde_json::Value, KeyError> {
    let fetch_err = |reason: String| KeyError::Fetch {
        url: url.to_string(),
        reason,
    };

    let response = http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| fetch_err(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(fetch_err(format!("HTTP {status}")));
    }

    let doc: serde_json::Value = response.json().await.map_err(|e| fetch_err(e.to_string()))?;
    if !doc.get("keys").is_some_and(serde_json::Value::is_array) {
        return Err(fetch_err("document has no keys array".to_string()));
    }
    Ok(doc)
}

/// Resolver combining an optional static fallback with per-provider sets.
///
/// With no provider sets the fallback is used on its own. Otherwise the
/// fallback is tried first and only a "key ID not found" answer moves on to
/// the provider sets, which are tried in their configured order. A key found
/// in a provider set is tagged with that provider's name.
pub struct MultiKeyResolver {
    fallback: Option<Arc<dyn KeyResolver>>,
    sets: Vec<Arc<ProviderKeySet>>,
    refresh_unknown_kid: bool,
}

impl MultiKeyResolver {
    /// Resolver over already-built provider sets.
    #[must_use]
    pub fn new(fallback: Option<Arc<dyn KeyResolver>>, sets: Vec<Arc<ProviderKeySet>>) -> Self {
        Self {
            fallback,
            sets,
            refresh_unknown_kid: false,
        }
    }

    /// Fetch a key set for each `(name, cert_url)` pair, in order.
    pub async fn connect<'a>(
        providers: impl IntoIterator<Item = (&'a str, &'a str)>,
        fallback: Option<Arc<dyn KeyResolver>>,
        http: &reqwest::Client,
    ) -> Result<Self, KeyError> {
        let mut sets = Vec::new();
        for (name, cert_url) in providers {
            sets.push(ProviderKeySet::fetch(name, cert_url, http.clone()).await?);
        }
        Ok(Self::new(fallback, sets))
    }

    /// Wake provider refresh tasks when a key ID is found nowhere.
    #[must_use]
    pub fn with_refresh_unknown_kid(mut self, enabled: bool) -> Self {
        self.refresh_unknown_kid = enabled;
        self
    }

    /// Provider key sets, in lookup order.
    #[must_use]
    pub fn sets(&self) -> &[Arc<ProviderKeySet>] {
        &self.sets
    }

    /// Start one refresh task per provider set.
    pub fn spawn_refresh(
        &self,
        interval: Duration,
        rate_limit: Duration,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        self.sets
            .iter()
            .map(|set| set.spawn_refresh(interval, rate_limit, shutdown.subscribe()))
            .collect()
    }
}

impl KeyResolver for MultiKeyResolver {
    fn resolve(&self, header: &Header) -> Result<ResolvedKey, KeyError> {
        if let Some(fallback) = &self.fallback {
            if self.sets.is_empty() {
                return fallback.resolve(header);
            }
            match fallback.resolve(header) {
                Ok(key) => return Ok(key),
                Err(e) if e.is_kid_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let kid = header.kid.as_deref().unwrap_or_default();
        for set in &self.sets {
            if let Some(key) = set.lookup(kid) {
                return Ok(ResolvedKey {
                    key,
                    provider: Some(set.name().to_string()),
                });
            }
        }

        if self.refresh_unknown_kid {
            for set in &self.sets {
                set.request_refresh();
            }
        }

        Err(KeyError::KidNotFoundInSets(kid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::keys::StaticKeys;
    use jsonwebtoken::Algorithm;
    use serde_json::json;

    fn header(kid: &str) -> Header {
        let mut h = Header::new(Algorithm::HS256);
        h.kid = Some(kid.to_string());
        h
    }

    #[test]
    fn snapshot_skips_unusable_entries() {
        // GIVEN: a document mixing a valid oct key, a key without kid and junk
        let doc = json!({"keys": [
            {"kty": "oct", "kid": "good", "alg": "HS256", "k": "c2VjcmV0"},
            {"kty": "oct", "alg": "HS256", "k": "c2VjcmV0"},
            {"kty": "nonsense"}
        ]});

        // WHEN: it is turned into a snapshot
        let snapshot = Snapshot::from_document(&doc);

        // THEN: only the usable key survives
        assert_eq!(snapshot.keys.len(), 1);
        assert!(snapshot.keys.contains_key("good"));
    }

    #[test]
    fn static_only_resolver_is_used_exclusively() {
        let fallback: Arc<dyn KeyResolver> =
            Arc::new(StaticKeys::new().with_secret("s1", Algorithm::HS256, b"x"));
        let resolver = MultiKeyResolver::new(Some(fallback), Vec::new());

        assert!(resolver.resolve(&header("s1")).is_ok());
        // The static resolver's own error surfaces unchanged.
        assert!(matches!(
            resolver.resolve(&header("zz")),
            Err(KeyError::KidNotFound(_))
        ));
    }

    #[test]
    fn empty_resolver_reports_kid_not_found_in_sets() {
        let resolver = MultiKeyResolver::new(None, Vec::new());
        assert!(matches!(
            resolver.resolve(&header("zz")),
            Err(KeyError::KidNotFoundInSets(_))
        ));
    }

    #[tokio::test]
    async fn missing_cert_url_is_rejected() {
        let err = ProviderKeySet::fetch("p", "", reqwest::Client::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, KeyError::MissingCertUrl(name) if name == "p"));
    }
}
