use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs as async_fs;

use super::key::with_suffix;

/// Metadata sidecar persisted next to each cached body.
///
/// Timestamps are UNIX seconds. `headers` keeps the first value of each
/// response header with the name casing as received; later values of
/// multi-value headers (e.g. `Set-Cookie`) are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub url: String,
    pub file_path: PathBuf,
    pub size: u64,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub created_at: u64,
    pub accessed_at: u64,
    pub expires_at: u64,
}

pub(super) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }

    pub fn created_at_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.created_at)
    }

    pub async fn load(meta_path: &Path) -> Result<Self> {
        let data = async_fs::read(meta_path)
            .await
            .with_context(|| format!("failed to read sidecar {}", meta_path.display()))?;
        parse_sidecar(&data, meta_path)
    }

    /// Synchronous loader for the startup scan, which runs before the
    /// listener and has no reason to hop onto the blocking pool per file.
    pub fn load_sync(meta_path: &Path) -> Result<Self> {
        let data = std::fs::read(meta_path)
            .with_context(|| format!("failed to read sidecar {}", meta_path.display()))?;
        parse_sidecar(&data, meta_path)
    }

    /// Persist the sidecar via a temp file and rename so readers never
    /// observe a torn document.
    pub async fn save(&self, meta_path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        let temp_path = with_suffix(meta_path, ".tmp");
        async_fs::write(&temp_path, &data)
            .await
            .with_context(|| format!("failed to write sidecar {}", temp_path.display()))?;
        if let Err(err) = async_fs::rename(&temp_path, meta_path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("failed to publish sidecar {}", meta_path.display()));
        }
        Ok(())
    }
}

fn parse_sidecar(data: &[u8], meta_path: &Path) -> Result<CacheEntry> {
    serde_json::from_slice(data)
        .with_context(|| format!("malformed sidecar {}", meta_path.display()))
}
