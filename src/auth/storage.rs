use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::ProxyError;

/// The OAuth token bundle persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Unix timestamp (seconds)
    pub expires_at: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl CredentialRecord {
    /// Seconds left before expiry (zero once expired)
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// True when more than `margin` seconds remain
    pub fn is_fresh(&self, now: u64, margin: u64) -> bool {
        self.remaining_secs(now) > margin
    }
}

/// File-backed store for a single [`CredentialRecord`].
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so readers only ever see the previous or the new record. Callers are
/// expected to serialize writes.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<CredentialRecord>, ProxyError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(
                    "Ignoring unreadable credential file {}: {e}",
                    self.path.display()
                );
                Ok(None)
            }
        }
    }

    pub async fn save(&self, record: &CredentialRecord) -> Result<(), ProxyError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_private_dir(parent).await?;
        }

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| ProxyError::StorageError(format!("Failed to encode credentials: {e}")))?;

        // Write to a temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("json.tmp");

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), ProxyError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn create_private_dir(dir: &Path) -> Result<(), ProxyError> {
    if fs::try_exists(dir).await? {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await?;
    Ok(())
}
