//! Session records in redis.
//!
//! Each session is a JSON string at `<key_prefix><id>` written with
//! `SET ... EX`, so expiry is left to redis.

use std::time::Duration;

use ::redis::AsyncCommands;
use ::redis::aio::MultiplexedConnection;

use super::{SessionBackend, SessionValues};
use crate::{Error, Result};

/// Redis session backend.
///
/// Holds one multiplexed connection; every call works on a cheap clone of it.
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
    /// Connect to `url`; fails fast when redis is unreachable.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| Error::Store(format!("failed to create redis client: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Store(format!("failed to connect to redis: {e}")))?;
        Ok(Self::with_connection(conn, key_prefix))
    }

    /// Use an existing connection.
    #[must_use]
    pub fn with_connection(conn: MultiplexedConnection, key_prefix: &str) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.to_string(),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{id}", self.key_prefix)
    }
}

#[async_trait::async_trait]
impl SessionBackend for RedisBackend {
    async fn load(&self, id: &str) -> Result<Option<SessionValues>> {
        let raw: Option<String> = self.conn.clone().get(self.key(id)).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(Error::from)).transpose()
    }

    async fn save(&self, id: &str, values: &SessionValues, ttl: Duration) -> Result<()> {
        let data = serde_json::to_string(values)?;
        let secs = ttl.as_secs().max(1);
        let () = self.conn.clone().set_ex(self.key(id), data, secs).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _: i64 = self.conn.clone().del(self.key(id)).await?;
        Ok(())
    }

    async fn reap_expired(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
