//! Session files on local disk.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{SessionBackend, SessionValues};
use crate::{Error, Result};

const FILE_PREFIX: &str = "session_";

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    values: SessionValues,
    /// Unix seconds
    expires_at: i64,
}

impl Record {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// One JSON file per session, named `session_<id>`.
///
/// Writes go to a temporary file that is renamed into place, so readers
/// never see a partial record.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Use `dir`, creating it when missing.
    pub async fn new(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Store(format!("failed to create session dir {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(Error::Store(format!("invalid session id {id:?}")));
        }
        Ok(self.dir.join(format!("{FILE_PREFIX}{id}")))
    }
}

#[async_trait::async_trait]
impl SessionBackend for FileBackend {
    async fn load(&self, id: &str) -> Result<Option<SessionValues>> {
        let path = self.path(id)?;
        let content = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: Record = match serde_json::from_slice(&content) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable session file");
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
        };

        if record.is_expired(chrono::Utc::now().timestamp()) {
            // Lazy eviction
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(record.values))
    }

    async fn save(&self, id: &str, values: &SessionValues, ttl: Duration) -> Result<()> {
        let path = self.path(id)?;
        let record = Record {
            values: values.clone(),
            expires_at: chrono::Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2),
        };
        let content = serde_json::to_vec(&record)?;

        let tmp = self.dir.join(format!(".{FILE_PREFIX}{id}.{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await;
        }

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn reap_expired(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list session dir");
                return 0;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut reaped = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_name().to_string_lossy().starts_with(FILE_PREFIX) {
                continue;
            }
            let path = entry.path();
            let expired = match tokio::fs::read(&path).await {
                Ok(content) => serde_json::from_slice::<Record>(&content).map_or(true, |r| r.is_expired(now)),
                Err(_) => false,
            };
            if expired && tokio::fs::remove_file(&path).await.is_ok() {
                debug!(path = %path.display(), "Reaped session file");
                reaped += 1;
            }
        }
        reaped
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
