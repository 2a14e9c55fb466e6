use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, unix_now};
use super::key::{self, cache_key, with_suffix};
use super::lock::{LockGuard, LockTable};
use super::lru::LruIndex;

/// A candidate body failed validation after it was fully received.
///
/// Rejections are logged by the caller and never reach the client; the bytes
/// already forwarded stand on their own.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("refusing to cache empty body")]
    Empty,
    #[error("incomplete body: wrote {written} bytes, expected {expected}")]
    SizeMismatch { written: u64, expected: u64 },
    #[error("body too small to cache: {written} bytes (min {min})")]
    TooSmall { written: u64, min: u64 },
    #[error("body too large to cache: {written} bytes (max {max})")]
    TooLarge { written: u64, max: u64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Rejected(#[from] AdmissionError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub bytes_used: u64,
    pub capacity: u64,
    pub entries: usize,
}

/// Content-addressed on-disk cache: bodies and metadata sidecars sharded by
/// key prefix, an advisory in-memory LRU for eviction order, and a lock table
/// giving every key a cross-task, cross-process critical section.
pub struct Storage {
    base_dir: PathBuf,
    lru: LruIndex,
    locks: LockTable,
    buffer_size: usize,
    min_file_size: u64,
    max_file_size: u64,
}

/// Streaming handle for a cached body. Holds the per-key lock for as long as
/// the caller keeps reading; dropping it releases the lock.
pub struct CacheBodyReader {
    file: async_fs::File,
    _guard: LockGuard,
}

impl AsyncRead for CacheBodyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl Storage {
    /// Open (creating if needed) the cache directory and rebuild the LRU from
    /// the sidecars found on disk. Expired entries are deleted during the
    /// scan; unreadable sidecars are skipped.
    pub fn open(
        base_dir: impl Into<PathBuf>,
        capacity_bytes: u64,
        buffer_size: usize,
        min_file_size: u64,
        max_file_size: u64,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create cache directory {}", base_dir.display()))?;

        let storage = Self {
            base_dir,
            lru: LruIndex::new(capacity_bytes),
            locks: LockTable::new(),
            buffer_size,
            min_file_size,
            max_file_size,
        };
        storage.scan_existing()?;

        let stats = storage.stats();
        info!(
            directory = %storage.base_dir.display(),
            entries = stats.entries,
            bytes_used = stats.bytes_used,
            capacity = stats.capacity,
            "cache storage ready"
        );
        Ok(storage)
    }

    /// Look up a cached body. Any failure on the read path (missing or
    /// malformed sidecar, vanished body file) degrades to a miss; expired
    /// entries are deleted and reported as a miss.
    pub async fn get(&self, url: &str) -> Option<(CacheEntry, CacheBodyReader)> {
        let key = cache_key(url);
        let data_path = key::data_path(&self.base_dir, &key);
        let meta_path = key::meta_path(&self.base_dir, &key);

        let guard = match self.locks.lock(&data_path).await {
            Ok(guard) => guard,
            Err(err) => {
                warn!(url, error = %err, "failed to lock cache entry for read");
                return None;
            }
        };

        let mut entry = CacheEntry::load(&meta_path).await.ok()?;

        if entry.is_expired() {
            drop(guard);
            debug!(url, "cache entry expired");
            if let Err(err) = self.delete(url).await {
                warn!(url, error = %err, "failed to delete expired cache entry");
            }
            return None;
        }

        let file = match async_fs::File::open(&data_path).await {
            Ok(file) => file,
            Err(err) => {
                debug!(url, error = %err, "cache body missing; treating as miss");
                return None;
            }
        };

        entry.accessed_at = unix_now();
        if let Err(err) = entry.save(&meta_path).await {
            debug!(url, error = %err, "failed to refresh sidecar access time");
        }
        self.lru.touch(&key);

        Some((entry, CacheBodyReader { file, _guard: guard }))
    }

    /// Stream `source` into the cache under the key for `url`.
    ///
    /// The body is written to a temp file and fsynced before admission is
    /// decided; rejected or failed writes remove the temp file and leave the
    /// LRU and metadata untouched. Returns the number of bytes admitted.
    pub async fn put(
        &self,
        url: &str,
        content_type: &str,
        headers: BTreeMap<String, String>,
        ttl: Duration,
        mut source: impl AsyncRead + Unpin,
        expected_size: Option<u64>,
    ) -> Result<u64, StoreError> {
        let key = cache_key(url);
        let data_path = key::data_path(&self.base_dir, &key);
        let meta_path = key::meta_path(&self.base_dir, &key);

        if let Some(parent) = data_path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create cache shard {}", parent.display()))
                .map_err(StoreError::Io)?;
        }

        let _guard = self.locks.lock(&data_path).await.map_err(StoreError::Io)?;

        let temp_path = with_suffix(&data_path, ".tmp");
        let written = match self.write_temp(&temp_path, &mut source).await {
            Ok(written) => written,
            Err(err) => {
                let _ = async_fs::remove_file(&temp_path).await;
                return Err(StoreError::Io(err));
            }
        };

        if let Err(rejection) = self.admit(written, expected_size) {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(StoreError::Rejected(rejection));
        }

        self.evict_until_fits(written).await;

        if let Err(err) = async_fs::rename(&temp_path, &data_path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(StoreError::Io(
                anyhow!(err).context("failed to publish cache body"),
            ));
        }

        let now = unix_now();
        let entry = CacheEntry {
            key: key.clone(),
            url: url.to_string(),
            file_path: data_path.clone(),
            size: written,
            content_type: content_type.to_string(),
            headers,
            created_at: now,
            accessed_at: now,
            expires_at: now.saturating_add(ttl.as_secs()),
        };

        if let Err(err) = entry.save(&meta_path).await {
            let _ = async_fs::remove_file(&data_path).await;
            return Err(StoreError::Io(err));
        }

        self.lru.add(&key, written);
        Ok(written)
    }

    /// Remove the entry for `url`. Missing files are not an error.
    pub async fn delete(&self, url: &str) -> Result<()> {
        let key = cache_key(url);
        let data_path = key::data_path(&self.base_dir, &key);
        let meta_path = key::meta_path(&self.base_dir, &key);

        let _guard = self.locks.lock(&data_path).await?;
        let _ = async_fs::remove_file(&data_path).await;
        let _ = async_fs::remove_file(&meta_path).await;
        self.lru.remove(&key);
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            bytes_used: self.lru.bytes_used(),
            capacity: self.lru.capacity(),
            entries: self.lru.len(),
        }
    }

    async fn write_temp(
        &self,
        temp_path: &Path,
        source: &mut (impl AsyncRead + Unpin),
    ) -> Result<u64> {
        let mut file = async_fs::File::create(temp_path)
            .await
            .with_context(|| format!("failed to create temp file {}", temp_path.display()))?;

        let mut buffer = vec![0u8; self.buffer_size];
        let mut written = 0u64;
        loop {
            let read = source
                .read(&mut buffer)
                .await
                .context("reading cache source stream")?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .await
                .context("writing cache temp file")?;
            written = written.saturating_add(read as u64);
        }

        file.flush().await.context("flushing cache temp file")?;
        file.sync_all().await.context("syncing cache temp file")?;
        Ok(written)
    }

    fn admit(&self, written: u64, expected_size: Option<u64>) -> Result<(), AdmissionError> {
        if written == 0 {
            return Err(AdmissionError::Empty);
        }
        if let Some(expected) = expected_size
            && expected > 0
            && written != expected
        {
            return Err(AdmissionError::SizeMismatch { written, expected });
        }
        if written < self.min_file_size {
            return Err(AdmissionError::TooSmall {
                written,
                min: self.min_file_size,
            });
        }
        if written > self.max_file_size {
            return Err(AdmissionError::TooLarge {
                written,
                max: self.max_file_size,
            });
        }
        Ok(())
    }

    /// Evict least-recently-used entries until `incoming` more bytes fit.
    ///
    /// Runs inside `put`'s per-key critical section; index mutations are
    /// serialized by the LRU's own mutex. When a sidecar cannot be loaded the
    /// body reference is still dropped from the index.
    async fn evict_until_fits(&self, incoming: u64) {
        while self.lru.bytes_used().saturating_add(incoming) > self.lru.capacity() {
            let Some((key, size)) = self.lru.oldest() else {
                break;
            };
            let data_path = key::data_path(&self.base_dir, &key);
            let meta_path = key::meta_path(&self.base_dir, &key);
            match CacheEntry::load(&meta_path).await {
                Ok(entry) => {
                    let _ = async_fs::remove_file(&entry.file_path).await;
                    let _ = async_fs::remove_file(&meta_path).await;
                    info!(url = %entry.url, size, "evicted cache entry");
                }
                Err(err) => {
                    debug!(path = %data_path.display(), error = %err, "evicting index entry without sidecar");
                }
            }
            self.lru.remove(&key);
        }
    }

    fn scan_existing(&self) -> Result<()> {
        let shards = std::fs::read_dir(&self.base_dir)
            .with_context(|| format!("failed to scan cache directory {}", self.base_dir.display()))?;

        for shard in shards.flatten() {
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let files = match std::fs::read_dir(shard.path()) {
                Ok(files) => files,
                Err(err) => {
                    debug!(shard = %shard.path().display(), error = %err, "skipping unreadable shard");
                    continue;
                }
            };
            for file in files.flatten() {
                let path = file.path();
                let name = file.file_name();
                let name = name.to_string_lossy();
                if name.ends_with(".data.tmp") || name.ends_with(".data.lock") {
                    // Leftovers from an interrupted write; the lock table
                    // recreates lock files on demand.
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
                if !name.ends_with(".meta") {
                    continue;
                }
                match CacheEntry::load_sync(&path) {
                    Ok(entry) if entry.is_expired() => {
                        let _ = std::fs::remove_file(&entry.file_path);
                        let _ = std::fs::remove_file(&path);
                        debug!(url = %entry.url, "dropped expired cache entry during scan");
                    }
                    Ok(entry) => {
                        self.lru.add(&entry.key, entry.size);
                    }
                    Err(err) => {
                        debug!(path = %path.display(), error = %err, "skipping unreadable sidecar");
                    }
                }
            }
        }
        Ok(())
    }
}
