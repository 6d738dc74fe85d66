//! Cookie-addressed session persistence.
//!
//! A session is a small string map stored in a [`SessionBackend`] under a
//! random ID. The browser only holds `<id>.<signature>`, where the signature
//! is an HMAC-SHA256 of the ID under the store's session key; cookies with a
//! bad signature are treated as absent.
//!
//! Backends are interchangeable and chosen by configuration. Different
//! sessions never contend; concurrent writes to one session are
//! last-write-wins.

mod file;
#[cfg(feature = "redis")]
mod redis;

pub use file::FileBackend;
#[cfg(feature = "redis")]
pub use redis::RedisBackend;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use cookie::Cookie;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::{SessionCookieOptions, SessionStoreConfig, SessionStoreKind};
use crate::{Error, Result};

/// Session contents.
pub type SessionValues = BTreeMap<String, String>;

/// Storage for session records.
///
/// Implementations must be `Send + Sync` because one store is shared by all
/// request tasks.
#[async_trait::async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    /// Load a live record. Expired records read as `None`.
    async fn load(&self, id: &str) -> Result<Option<SessionValues>>;

    /// Write a record that expires after `ttl`.
    async fn save(&self, id: &str, values: &SessionValues, ttl: Duration) -> Result<()>;

    /// Remove a record. Removing a missing record is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Drop expired records; backends with native expiry return 0.
    async fn reap_expired(&self) -> usize;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// A session as seen by one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Record ID
    pub id: String,
    /// No record existed; `values` is empty
    pub is_new: bool,
    /// Record contents
    pub values: SessionValues,
}

/// Signed-cookie front end over a [`SessionBackend`].
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    key: Vec<u8>,
    options: SessionCookieOptions,
}

impl SessionStore {
    /// Store signing cookie IDs with `key`.
    pub fn new(backend: Arc<dyn SessionBackend>, key: Vec<u8>, options: SessionCookieOptions) -> Self {
        Self { backend, key, options }
    }

    /// Build the configured backend.
    pub async fn from_config(config: &SessionStoreConfig, options: SessionCookieOptions) -> Result<Self> {
        let (backend, session_key): (Arc<dyn SessionBackend>, Option<&str>) = match config.active_kind()? {
            SessionStoreKind::File => {
                let file = config
                    .file
                    .as_ref()
                    .ok_or_else(|| Error::Config("file store is not configured".to_string()))?;
                let dir = if file.path.is_empty() {
                    std::env::temp_dir()
                } else {
                    file.path.clone().into()
                };
                (Arc::new(FileBackend::new(dir).await?), file.session_key.as_deref())
            }
            #[cfg(feature = "redis")]
            SessionStoreKind::Redis => {
                let redis = config
                    .redis
                    .as_ref()
                    .ok_or_else(|| Error::Config("redis store is not configured".to_string()))?;
                let backend = RedisBackend::connect(&redis.connection.url(), &redis.connection.key_prefix).await?;
                (Arc::new(backend), redis.session_key.as_deref())
            }
            #[cfg(not(feature = "redis"))]
            SessionStoreKind::Redis => {
                return Err(Error::Config(
                    "redis session store requires the `redis` feature".to_string(),
                ));
            }
        };

        let key = match session_key.filter(|k| !k.is_empty()) {
            Some(k) => k.as_bytes().to_vec(),
            None => {
                warn!("No session_key configured; sessions will not survive a restart");
                rand::random::<[u8; 32]>().to_vec()
            }
        };

        Ok(Self::new(backend, key, options))
    }

    /// The backing store.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    /// Resolve a session cookie value. A missing, forged or expired cookie
    /// gives a fresh empty session.
    pub async fn get(&self, cookie_value: Option<&str>) -> Result<SessionState> {
        if let Some(id) = cookie_value.and_then(|v| self.verify_cookie(v)) {
            if let Some(values) = self.backend.load(id).await? {
                return Ok(SessionState {
                    id: id.to_string(),
                    is_new: false,
                    values,
                });
            }
            debug!(backend = self.backend.name(), "Session record not found");
        }

        Ok(SessionState {
            id: new_session_id(),
            is_new: true,
            values: SessionValues::new(),
        })
    }

    /// Persist `state` and return the cookie to set.
    pub async fn save(&self, cookie_name: &str, state: &SessionState) -> Result<Cookie<'static>> {
        let ttl = Duration::from_secs(u64::try_from(self.options.max_age).unwrap_or(0));
        self.backend.save(&state.id, &state.values, ttl).await?;
        Ok(self.cookie(cookie_name, self.sign(&state.id), self.options.max_age))
    }

    /// Remove the record and return an expiring cookie.
    pub async fn delete(&self, cookie_name: &str, id: &str) -> Result<Cookie<'static>> {
        self.backend.delete(id).await?;
        Ok(self.removal_cookie(cookie_name))
    }

    /// A cookie that clears `cookie_name` in the browser.
    #[must_use]
    pub fn removal_cookie(&self, cookie_name: &str) -> Cookie<'static> {
        self.cookie(cookie_name, String::new(), 0)
    }

    fn cookie(&self, name: &str, value: String, max_age: i64) -> Cookie<'static> {
        let mut builder = Cookie::build((name.to_string(), value))
            .path(self.options.path.clone())
            .max_age(cookie::time::Duration::seconds(max_age))
            .secure(self.options.secure)
            .http_only(self.options.http_only);
        if let Some(domain) = &self.options.domain {
            builder = builder.domain(domain.clone());
        }
        if let Some(same_site) = self.options.same_site {
            builder = builder.same_site(same_site.into());
        }
        builder.build()
    }

    fn sign(&self, id: &str) -> String {
        format!("{id}.{}", URL_SAFE_NO_PAD.encode(self.mac(id)))
    }

    /// The ID inside a correctly signed cookie value.
    fn verify_cookie<'v>(&self, value: &'v str) -> Option<&'v str> {
        let (id, sig) = value.rsplit_once('.')?;
        let sig = URL_SAFE_NO_PAD.decode(sig).ok()?;
        if id.is_empty() || !bool::from(self.mac(id).as_slice().ct_eq(&sig)) {
            debug!("Rejected session cookie with bad signature");
            return None;
        }
        Some(id)
    }

    fn mac(&self, id: &str) -> Vec<u8> {
        let Ok(mut mac) = <Hmac<Sha256> as hmac::digest::KeyInit>::new_from_slice(&self.key) else {
            return Vec::new();
        };
        mac.update(id.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Spawn a background task that reaps expired sessions every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    backend: Arc<dyn SessionBackend>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = backend.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, backend = backend.name(), "Reaped expired sessions");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &std::path::Path) -> SessionStore {
        let backend = FileBackend::new(dir.to_path_buf()).await.unwrap();
        SessionStore::new(Arc::new(backend), b"test-session-key".to_vec(), SessionCookieOptions::default())
    }

    #[tokio::test]
    async fn missing_cookie_gives_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let state = store.get(None).await.unwrap();

        assert!(state.is_new);
        assert!(state.values.is_empty());
        assert_eq!(state.id.len(), 32);
    }

    #[tokio::test]
    async fn saved_session_is_found_by_its_cookie() {
        // GIVEN: a saved session
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let mut state = store.get(None).await.unwrap();
        state.values.insert("provider".to_string(), "keycloak".to_string());

        // WHEN: it is saved and read back through the cookie value
        let cookie = store.save("auth_session", &state).await.unwrap();
        let loaded = store.get(Some(cookie.value())).await.unwrap();

        // THEN: the values come back
        assert!(!loaded.is_new);
        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.values["provider"], "keycloak");
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::seconds(86_400)));
        assert_eq!(cookie.path(), Some("/"));
    }

    #[tokio::test]
    async fn forged_signature_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let mut state = store.get(None).await.unwrap();
        state.values.insert("k".to_string(), "v".to_string());
        store.save("auth_session", &state).await.unwrap();

        let forged = format!("{}.AAAA", state.id);
        let loaded = store.get(Some(&forged)).await.unwrap();

        assert!(loaded.is_new);
        assert_ne!(loaded.id, state.id);
    }

    #[tokio::test]
    async fn cookie_signed_with_other_key_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let a = store(dir.path()).await;
        let b = SessionStore::new(
            Arc::new(FileBackend::new(dir.path().to_path_buf()).await.unwrap()),
            b"another-key".to_vec(),
            SessionCookieOptions::default(),
        );
        let state = a.get(None).await.unwrap();
        let cookie = a.save("auth_session", &state).await.unwrap();

        assert!(b.get(Some(cookie.value())).await.unwrap().is_new);
    }

    #[tokio::test]
    async fn delete_removes_record_and_expires_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let state = store.get(None).await.unwrap();
        let cookie = store.save("auth_session", &state).await.unwrap();

        let removal = store.delete("auth_session", &state.id).await.unwrap();

        assert_eq!(removal.max_age(), Some(cookie::time::Duration::ZERO));
        assert_eq!(removal.value(), "");
        assert!(store.get(Some(cookie.value())).await.unwrap().is_new);
    }
}
