//! Access-ordered entry index.
//!
//! The index maps keys to entry metadata and maintains least-recently-used
//! ordering: lookups and inserts move a key to the most-recent end, and
//! eviction walks from the least-recent end.

use ahash::RandomState;
use lru::LruCache;

/// Metadata for one cache entry.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Byte length of each published slot file, 0 for never-published slots.
    pub lengths: Vec<u64>,
    /// True once this entry has ever been successfully committed.
    pub readable: bool,
    /// Token of the in-progress edit, if any.
    pub current_editor: Option<u64>,
}

impl Entry {
    /// Create a fresh, unpublished entry with `value_count` empty slots.
    pub fn new(value_count: usize) -> Self {
        Self {
            lengths: vec![0; value_count],
            readable: false,
            current_editor: None,
        }
    }

    /// Total bytes across all published slots.
    pub fn total_len(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

/// Access-ordered mapping from key to [`Entry`].
pub struct EntryIndex {
    entries: LruCache<String, Entry, RandomState>,
}

impl EntryIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded_with_hasher(RandomState::new()),
        }
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    /// Look up an entry without disturbing the access order.
    pub fn peek(&self, key: &str) -> Option<&Entry> {
        self.entries.peek(key)
    }

    /// Mutable lookup without disturbing the access order.
    pub fn peek_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.peek_mut(key)
    }

    /// Insert an entry at the most-recent end.
    pub fn put(&mut self, key: String, entry: Entry) {
        self.entries.put(key, entry);
    }

    /// Remove and return the entry for `key`, if any.
    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        self.entries.pop(key)
    }

    /// Number of entries in the index.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Key of the least recently used entry that is not being edited.
    pub fn eviction_candidate(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(_, entry)| entry.current_editor.is_none())
            .map(|(key, _)| key.as_str())
    }

    /// All keys, ordered least to most recently used.
    pub fn keys_lru_first(&self) -> Vec<String> {
        self.entries.iter().rev().map(|(key, _)| key.clone()).collect()
    }
}

impl Default for EntryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(keys: &[&str]) -> EntryIndex {
        let mut index = EntryIndex::new();
        for key in keys {
            index.put((*key).to_string(), Entry::new(1));
        }
        index
    }

    #[test]
    fn test_insertion_order_is_access_order() {
        let index = index_with(&["a", "b", "c"]);
        assert_eq!(index.keys_lru_first(), vec!["a", "b", "c"]);
        assert_eq!(index.eviction_candidate(), Some("a"));
    }

    #[test]
    fn test_get_touches() {
        let mut index = index_with(&["a", "b", "c"]);
        assert!(index.get("a").is_some());
        assert_eq!(index.keys_lru_first(), vec!["b", "c", "a"]);
        assert_eq!(index.eviction_candidate(), Some("b"));
    }

    #[test]
    fn test_get_on_missing_key_changes_nothing() {
        let mut index = index_with(&["a", "b"]);
        assert!(index.get("zz").is_none());
        assert_eq!(index.keys_lru_first(), vec!["a", "b"]);
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut index = index_with(&["a", "b"]);
        assert!(index.peek("a").is_some());
        assert!(index.peek_mut("a").is_some());
        assert_eq!(index.eviction_candidate(), Some("a"));
    }

    #[test]
    fn test_put_existing_key_touches() {
        let mut index = index_with(&["a", "b"]);
        index.put("a".to_string(), Entry::new(1));
        assert_eq!(index.keys_lru_first(), vec!["b", "a"]);
    }

    #[test]
    fn test_eviction_candidate_skips_edited_entries() {
        let mut index = index_with(&["a", "b", "c"]);
        index.peek_mut("a").unwrap().current_editor = Some(1);
        assert_eq!(index.eviction_candidate(), Some("b"));
        index.peek_mut("b").unwrap().current_editor = Some(2);
        assert_eq!(index.eviction_candidate(), Some("c"));
        index.peek_mut("c").unwrap().current_editor = Some(3);
        assert_eq!(index.eviction_candidate(), None);
    }

    #[test]
    fn test_remove() {
        let mut index = index_with(&["a", "b"]);
        assert!(index.remove("a").is_some());
        assert!(index.remove("a").is_none());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_total_len() {
        let mut entry = Entry::new(3);
        entry.lengths = vec![5, 0, 7];
        assert_eq!(entry.total_len(), 12);
    }
}
