use lru::LruCache;
use parking_lot::Mutex;

/// Byte-accounting recency index over the on-disk entries.
///
/// The index is advisory: the storage engine owns the authoritative disk
/// state, rebuilds this at startup, and consults `oldest` when it needs to
/// evict. All operations take one short mutex and never block on I/O.
#[derive(Debug)]
pub struct LruIndex {
    inner: Mutex<Inner>,
    capacity: u64,
}

#[derive(Debug)]
struct Inner {
    entries: LruCache<String, u64>,
    bytes: u64,
}

impl LruIndex {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            capacity,
        }
    }

    /// Insert or refresh a key, promoting it to most recently used. Replacing
    /// an existing key adjusts the byte total by the size delta.
    pub fn add(&self, key: &str, size: u64) {
        let mut inner = self.inner.lock();
        let old = inner.entries.put(key.to_string(), size);
        inner.bytes = inner.bytes.saturating_sub(old.unwrap_or(0)).saturating_add(size);
    }

    /// Promote a key to most recently used. Returns false if absent.
    pub fn touch(&self, key: &str) -> bool {
        self.inner.lock().entries.get(key).is_some()
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(size) = inner.entries.pop(key) {
            inner.bytes = inner.bytes.saturating_sub(size);
        }
    }

    /// The least recently used entry, without promoting or removing it.
    pub fn oldest(&self) -> Option<(String, u64)> {
        let inner = self.inner.lock();
        inner
            .entries
            .peek_lru()
            .map(|(key, size)| (key.clone(), *size))
    }

    pub fn bytes_used(&self) -> u64 {
        self.inner.lock().bytes
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::LruIndex;

    #[test]
    fn add_tracks_total_bytes() {
        let index = LruIndex::new(100);
        index.add("a", 10);
        index.add("b", 20);
        assert_eq!(index.bytes_used(), 30);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn re_adding_adjusts_by_delta() {
        let index = LruIndex::new(100);
        index.add("a", 10);
        index.add("a", 25);
        assert_eq!(index.bytes_used(), 25);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_subtracts_and_forgets() {
        let index = LruIndex::new(100);
        index.add("a", 10);
        index.add("b", 20);
        index.remove("a");
        assert_eq!(index.bytes_used(), 20);
        assert!(!index.touch("a"));
        index.remove("a");
        assert_eq!(index.bytes_used(), 20);
    }

    #[test]
    fn oldest_is_least_recently_used() {
        let index = LruIndex::new(100);
        index.add("a", 1);
        index.add("b", 2);
        index.add("c", 3);
        assert_eq!(index.oldest(), Some(("a".to_string(), 1)));

        assert!(index.touch("a"));
        assert_eq!(index.oldest(), Some(("b".to_string(), 2)));
    }

    #[test]
    fn oldest_does_not_promote() {
        let index = LruIndex::new(100);
        index.add("a", 1);
        index.add("b", 2);
        assert_eq!(index.oldest(), Some(("a".to_string(), 1)));
        assert_eq!(index.oldest(), Some(("a".to_string(), 1)));
    }

    #[test]
    fn empty_index_has_no_oldest() {
        let index = LruIndex::new(100);
        assert!(index.oldest().is_none());
        assert!(index.is_empty());
        assert_eq!(index.capacity(), 100);
    }
}
