//! Short-lived login artifacts: CSRF state and internal authorization codes.
//!
//! Entries live for seconds to minutes and are consumed at most once. Two
//! backends: process memory, or redis when several gateway instances share
//! one login flow.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis::RedisBackend;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{EphemeralStoreConfig, EphemeralStoreKind};
use crate::{Error, Result};

/// Key/value storage with per-entry expiry.
#[async_trait::async_trait]
pub trait EphemeralBackend: Send + Sync + 'static {
    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Read a live entry.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read and remove a live entry in one step; a second call sees `None`.
    async fn take(&self, key: &str) -> Result<Option<String>>;

    /// Drop expired entries; backends with native expiry return 0.
    async fn reap_expired(&self) -> usize;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// What an internal authorization code stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeGrant {
    /// User alias the code was issued for
    pub alias: String,
    /// Requested scopes
    #[serde(default)]
    pub scope: Vec<String>,
}

/// CSRF state and internal code store.
#[derive(Clone)]
pub struct CodeStore {
    backend: Arc<dyn EphemeralBackend>,
    code_ttl: Duration,
    state_ttl: Duration,
}

impl CodeStore {
    /// Store over `backend` with the given lifetimes.
    pub fn new(backend: Arc<dyn EphemeralBackend>, code_ttl: Duration, state_ttl: Duration) -> Self {
        Self {
            backend,
            code_ttl,
            state_ttl,
        }
    }

    /// In-memory store with the configured lifetimes.
    #[must_use]
    pub fn in_memory(config: &EphemeralStoreConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), config.code_ttl, config.state_ttl)
    }

    /// Build the configured backend.
    pub async fn from_config(config: &EphemeralStoreConfig) -> Result<Self> {
        match config.active_kind()? {
            EphemeralStoreKind::Memory => Ok(Self::in_memory(config)),
            #[cfg(feature = "redis")]
            EphemeralStoreKind::Redis => {
                let conn = config
                    .redis
                    .as_ref()
                    .ok_or_else(|| Error::Config("login store redis is not configured".to_string()))?;
                let backend = RedisBackend::connect(&conn.url(), &conn.key_prefix).await?;
                Ok(Self::new(Arc::new(backend), config.code_ttl, config.state_ttl))
            }
            #[cfg(not(feature = "redis"))]
            EphemeralStoreKind::Redis => Err(Error::Config(
                "redis login store requires the `redis` feature".to_string(),
            )),
        }
    }

    /// The backing store.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn EphemeralBackend> {
        &self.backend
    }

    /// Issue a one-time code for `alias`.
    pub async fn code_gen(&self, alias: &str, scope: Vec<String>) -> Result<String> {
        let code = uuid::Uuid::new_v4().simple().to_string();
        let grant = CodeGrant {
            alias: alias.to_string(),
            scope,
        };
        self.backend
            .set(&code_key(&code), &serde_json::to_string(&grant)?, self.code_ttl)
            .await?;
        debug!(alias = %alias, "Issued internal authorization code");
        Ok(code)
    }

    /// Redeem a code. Unknown, expired and already used codes give `None`.
    pub async fn redeem(&self, code: &str) -> Result<Option<CodeGrant>> {
        match self.backend.take(&code_key(code)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remember a CSRF `state` issued for `provider`.
    pub async fn put_state(&self, state: &str, provider: &str) -> Result<()> {
        self.backend.set(&state_key(state), provider, self.state_ttl).await
    }

    /// Consume a CSRF `state`, returning the provider it was issued for.
    pub async fn take_state(&self, state: &str) -> Result<Option<String>> {
        if state.is_empty() {
            return Err(Error::Csrf("state is empty".to_string()));
        }
        self.backend.take(&state_key(state)).await
    }
}

/// Periodically drop expired entries until `shutdown` fires.
pub fn spawn_reaper(
    backend: Arc<dyn EphemeralBackend>,
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
                        debug!(count = reaped, backend = backend.name(), "Reaped expired login entries");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

fn code_key(code: &str) -> String {
    format!("code_{code}")
}

fn state_key(state: &str) -> String {
    format!("state_{state}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CodeStore {
        CodeStore::in_memory(&EphemeralStoreConfig::default())
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let store = store();
        let code = store.code_gen("alice", vec!["openid".to_string()]).await.unwrap();

        let grant = store.redeem(&code).await.unwrap().unwrap();

        assert_eq!(grant.alias, "alice");
        assert_eq!(grant.scope, vec!["openid"]);
        assert!(store.redeem(&code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_is_bound_to_provider_and_consumed() {
        let store = store();
        store.put_state("S1", "keycloak").await.unwrap();

        assert_eq!(store.take_state("S1").await.unwrap().as_deref(), Some("keycloak"));
        assert!(store.take_state("S1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_code_cannot_be_redeemed() {
        let store = CodeStore::new(
            Arc::new(MemoryBackend::new()),
            Duration::from_millis(20),
            Duration::from_secs(60),
        );
        let code = store.code_gen("bob", Vec::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.redeem(&code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_state_is_a_csrf_error() {
        assert!(matches!(store().take_state("").await, Err(Error::Csrf(_))));
    }
}
