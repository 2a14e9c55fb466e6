mod entry;
mod key;
mod lock;
mod lru;
mod storage;

pub use entry::CacheEntry;
pub use key::cache_key;
pub use lock::{LockGuard, LockTable};
pub use lru::LruIndex;
pub use storage::{AdmissionError, CacheBodyReader, Storage, StorageStats, StoreError};
