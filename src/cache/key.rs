use std::path::{Path, PathBuf};

/// Derive the cache key for a URL: the lowercase hex blake3 digest.
///
/// The key doubles as the on-disk file stem, so it must be stable across
/// restarts and collision-free over any realistic working set.
pub fn cache_key(url: &str) -> String {
    blake3::hash(url.as_bytes()).to_hex().to_string()
}

/// Shard directory for a key: `<base>/<first two hex chars>`.
pub(super) fn shard_dir(base_dir: &Path, key: &str) -> PathBuf {
    base_dir.join(&key[..2])
}

pub(super) fn data_path(base_dir: &Path, key: &str) -> PathBuf {
    shard_dir(base_dir, key).join(format!("{key}.data"))
}

pub(super) fn meta_path(base_dir: &Path, key: &str) -> PathBuf {
    shard_dir(base_dir, key).join(format!("{key}.meta"))
}

/// Append a suffix to a path without replacing its extension
/// (`x.data` → `x.data.tmp`, `x.data.lock`).
pub(super) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
