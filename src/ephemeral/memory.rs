//! In-process ephemeral backend.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use super::EphemeralBackend;
use crate::Result;

/// `DashMap` of values with deadlines. Expired entries are evicted on access
/// and by [`EphemeralBackend::reap_expired`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryBackend {
    /// Empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl EphemeralBackend for MemoryBackend {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        let (value, deadline) = entry.value().clone();
        drop(entry);

        if deadline <= Instant::now() {
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(value))
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .remove(key)
            .and_then(|(_, (value, deadline))| (deadline > Instant::now()).then_some(value)))
    }

    async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, deadline)| *deadline > now);
        let reaped = before.saturating_sub(self.entries.len());
        if reaped > 0 {
            debug!(count = reaped, "Reaped expired login entries");
        }
        reaped
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn take_removes_entry() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", Duration::from_secs(5)).await.unwrap();

        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(backend.take("k").await.unwrap().as_deref(), Some("v"));
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reaper_drops_only_expired_entries() {
        let backend = MemoryBackend::new();
        backend.set("old", "v", Duration::ZERO).await.unwrap();
        backend.set("new", "v", Duration::from_secs(60)).await.unwrap();

        assert_eq!(backend.reap_expired().await, 1);
        assert_eq!(backend.len(), 1);
    }
}
