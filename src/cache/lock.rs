use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task;

use super::key::with_suffix;

/// Per-path mutual exclusion: a reference-counted in-process mutex per cache
/// path plus an advisory `flock` on `<path>.lock` for processes sharing the
/// cache directory.
///
/// The in-process mutex serializes tasks cheaply; only the winner per path
/// touches the lock file. The guard releases the file lock and removes the
/// lock file before handing the mutex to the next waiter.
#[derive(Clone, Default)]
pub struct LockTable {
    slots: Arc<Mutex<HashMap<PathBuf, Slot>>>,
}

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
}

pub struct LockGuard {
    table: LockTable,
    path: PathBuf,
    permit: Option<OwnedMutexGuard<()>>,
    lock_file: Option<std::fs::File>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &Path) -> Result<LockGuard> {
        let mutex = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(path.to_path_buf()).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            slot.mutex.clone()
        };

        let permit = mutex.lock_owned().await;

        let lock_path = with_suffix(path, ".lock");
        let acquire = task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = lock_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await;

        let lock_file = match acquire {
            Ok(Ok(file)) => file,
            Ok(Err(err)) => {
                drop(permit);
                self.release(path);
                return Err(err)
                    .with_context(|| format!("failed to acquire file lock for {}", path.display()));
            }
            Err(err) => {
                drop(permit);
                self.release(path);
                return Err(err).context("file lock task failed");
            }
        };

        Ok(LockGuard {
            table: self.clone(),
            path: path.to_path_buf(),
            permit: Some(permit),
            lock_file: Some(lock_file),
        })
    }

    fn release(&self, path: &Path) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(path) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(path);
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.lock_file.take() {
            let _ = FileExt::unlock(&file);
            drop(file);
            let _ = std::fs::remove_file(with_suffix(&self.path, ".lock"));
        }
        drop(self.permit.take());
        self.table.release(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn lock_file_exists_only_while_held() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("entry.data");
        let table = LockTable::new();

        let guard = table.lock(&path).await?;
        let lock_path = with_suffix(&path, ".lock");
        assert!(lock_path.exists());
        drop(guard);
        assert!(!lock_path.exists());
        assert_eq!(table.slot_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn same_path_serializes_concurrent_holders() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("entry.data");
        let table = LockTable::new();
        let in_section = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let path = path.clone();
            let in_section = in_section.clone();
            handles.push(tokio::spawn(async move {
                let _guard = table.lock(&path).await?;
                let inside = in_section.fetch_add(1, Ordering::SeqCst);
                assert_eq!(inside, 0, "two holders inside the critical section");
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            }));
        }
        for handle in handles {
            handle.await??;
        }
        assert_eq!(table.slot_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn distinct_paths_do_not_contend() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let table = LockTable::new();
        let first = table.lock(&dir.path().join("a.data")).await?;
        // Must not deadlock waiting on the first guard.
        let second = table.lock(&dir.path().join("b.data")).await?;
        drop((first, second));
        Ok(())
    }
}
