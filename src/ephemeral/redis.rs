//! Redis ephemeral backend; entries expire through `SET ... PX`.

use std::time::Duration;

use ::redis::AsyncCommands;
use ::redis::aio::MultiplexedConnection;

use super::EphemeralBackend;
use crate::{Error, Result};

/// Shared ephemeral backend for multi-instance deployments.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to `url`.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| Error::Store(format!("failed to create redis client: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Store(format!("failed to connect to redis: {e}")))?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

#[async_trait::async_trait]
impl EphemeralBackend for RedisBackend {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let () = self.conn.clone().pset_ex(self.key(key), value, millis).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn.clone().get(self.key(key)).await?)
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = ::redis::cmd("GETDEL")
            .arg(self.key(key))
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn reap_expired(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Runs against a real redis at `REDIS_URL` (default `redis://127.0.0.1:6379`):
///
/// ```bash
/// cargo test --features redis-tests -- redis_ --test-threads=1
/// ```
#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;

    fn url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn test_backend() -> (RedisBackend, MultiplexedConnection, String) {
        let prefix = format!("test-login-{}:", uuid::Uuid::new_v4().simple());
        let backend = RedisBackend::connect(&url(), &prefix)
            .await
            .expect("Redis connection failed -- is Redis running?");
        let raw = ::redis::Client::open(url())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        (backend, raw, prefix)
    }

    #[tokio::test]
    async fn redis_entry_uses_prefix_and_millisecond_ttl() {
        // GIVEN: a backend with a unique prefix
        let (backend, mut raw, prefix) = test_backend().await;

        // WHEN: a state entry is stored for two minutes
        backend.set("state-1", "kc", Duration::from_secs(120)).await.unwrap();

        // THEN: the value sits under the prefix and expires within two minutes
        let stored: Option<String> = raw.get(format!("{prefix}state-1")).await.unwrap();
        assert_eq!(stored.as_deref(), Some("kc"));

        let pttl: i64 = raw.pttl(format!("{prefix}state-1")).await.unwrap();
        assert!(pttl > 110_000 && pttl <= 120_000, "unexpected pttl {pttl}");
    }

    #[tokio::test]
    async fn redis_take_consumes_once() {
        let (backend, _raw, _prefix) = test_backend().await;
        backend.set("code-1", "grant", Duration::from_secs(10)).await.unwrap();

        assert_eq!(backend.get("code-1").await.unwrap().as_deref(), Some("grant"));
        assert_eq!(backend.take("code-1").await.unwrap().as_deref(), Some("grant"));
        assert_eq!(backend.take("code-1").await.unwrap(), None);
        assert_eq!(backend.get("code-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn redis_entry_expires() {
        let (backend, _raw, _prefix) = test_backend().await;

        backend.set("brief", "v", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(backend.get("brief").await.unwrap(), None);
    }
}
