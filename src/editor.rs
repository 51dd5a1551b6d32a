//! Multi-slot edit protocol.
//!
//! An [`Editor`] stages new values in per-slot dirty files and publishes
//! them atomically on commit: each written dirty file is renamed over its
//! clean counterpart, so a reader observes the full set of values as they
//! were before or after the commit, never a mix.

use crate::cache::Shared;
use crate::error::CacheResult;
use crate::paths;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-progress edit of one entry.
///
/// At most one editor exists per entry at a time. Obtain a writer for each
/// slot with [`new_writer`](Self::new_writer), then finish with
/// [`commit`](Self::commit) or [`abort`](Self::abort). An editor dropped
/// without doing either is aborted.
pub struct Editor {
    shared: Arc<Shared>,
    key: String,
    token: u64,
    value_count: usize,
    has_errors: Arc<AtomicBool>,
    completed: bool,
}

impl Editor {
    pub(crate) fn new(shared: Arc<Shared>, key: String, token: u64, value_count: usize) -> Self {
        Self {
            shared,
            key,
            token,
            value_count,
            has_errors: Arc::new(AtomicBool::new(false)),
            completed: false,
        }
    }

    /// The key being edited.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Open a writer for the value at `slot`.
    ///
    /// The bytes are staged in a dirty file and only published by
    /// [`commit`](Self::commit). Write failures are remembered: committing
    /// an edit whose writer failed aborts instead and removes the entry,
    /// so partial data is never published.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn new_writer(&self, slot: usize) -> CacheResult<SlotWriter> {
        assert!(
            slot < self.value_count,
            "slot {slot} out of range for {} values",
            self.value_count
        );
        let inner = self.shared.inner.lock();
        inner.check_editor(&self.key, self.token)?;
        let file = File::create(paths::dirty_file(inner.directory(), &self.key, slot))?;
        Ok(SlotWriter {
            file,
            errors: Arc::clone(&self.has_errors),
        })
    }

    /// Publish this edit so it is visible to readers.
    ///
    /// Releases the edit lock, so another edit may be started on the same
    /// key. If any slot writer recorded an error, the edit is aborted and
    /// the entry removed instead: the previously published version is
    /// stale once a replacement write has failed partway.
    pub fn commit(mut self) -> CacheResult<()> {
        self.completed = true;
        let mut inner = self.shared.inner.lock();
        if self.has_errors.load(Ordering::Relaxed) {
            inner.complete_edit(&self.key, self.token, false)?;
            inner.remove_entry(&self.key)?;
            Ok(())
        } else {
            inner.complete_edit(&self.key, self.token, true)
        }
    }

    /// Abandon this edit, deleting any staged values.
    ///
    /// Releases the edit lock. A previously published version of the entry
    /// is left untouched.
    pub fn abort(mut self) -> CacheResult<()> {
        self.completed = true;
        self.shared
            .inner
            .lock()
            .complete_edit(&self.key, self.token, false)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self
                .shared
                .inner
                .lock()
                .complete_edit(&self.key, self.token, false);
        }
    }
}

/// Byte sink for one value slot.
///
/// Wraps the staged dirty file. I/O failures are recorded on the owning
/// editor and still returned to the caller.
pub struct SlotWriter {
    file: File,
    errors: Arc<AtomicBool>,
}

impl Write for SlotWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.file.write(buf);
        if result.is_err() {
            self.errors.store(true, Ordering::Relaxed);
        }
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.file.flush();
        if result.is_err() {
            self.errors.store(true, Ordering::Relaxed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlobCache;
    use crate::journal::{Header, Record};
    use std::fs;
    use tempfile::tempdir;

    fn journal_records(dir: &std::path::Path, value_count: usize) -> Vec<Record> {
        let data = fs::read(dir.join(paths::JOURNAL_FILE)).expect("journal should exist");
        let mut buf = &data[..];
        Header::decode(&mut buf).expect("header should parse");
        let mut records = Vec::new();
        while let Some(record) = Record::decode(&mut buf, value_count).expect("record should parse")
        {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_failed_write_turns_commit_into_remove() {
        let dir = tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 1, 1, 100).unwrap();

        let editor = cache.edit("k").unwrap().expect("editor expected");
        let mut writer = editor.new_writer(0).unwrap();
        writer.write_all(b"partial").unwrap();
        // stand in for a filesystem write failure
        editor.has_errors.store(true, Ordering::Relaxed);
        editor.commit().unwrap();

        assert!(cache.get("k").unwrap().is_none());
        assert_eq!(cache.size(), 0);
        cache.flush().unwrap();

        let records = journal_records(dir.path(), 1);
        assert_eq!(
            records,
            vec![
                Record::Dirty {
                    key: "k".to_string()
                },
                Record::Remove {
                    key: "k".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_failed_write_on_republish_removes_previous_version() {
        let dir = tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 1, 1, 100).unwrap();

        let editor = cache.edit("k").unwrap().unwrap();
        editor.new_writer(0).unwrap().write_all(b"v1").unwrap();
        editor.commit().unwrap();
        assert_eq!(cache.size(), 2);

        let editor = cache.edit("k").unwrap().unwrap();
        editor.new_writer(0).unwrap().write_all(b"v2!").unwrap();
        editor.has_errors.store(true, Ordering::Relaxed);
        editor.commit().unwrap();

        // the stale previous version must not survive
        assert!(cache.get("k").unwrap().is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_dropped_editor_aborts() {
        let dir = tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 1, 1, 100).unwrap();

        {
            let editor = cache.edit("k").unwrap().unwrap();
            editor.new_writer(0).unwrap().write_all(b"temp").unwrap();
        }

        // the edit lock is released and no value was published
        assert!(cache.get("k").unwrap().is_none());
        assert!(cache.edit("k").unwrap().is_some());
        assert!(!paths::dirty_file(dir.path(), "k", 0).exists());
    }

    #[test]
    fn test_writer_after_completion_is_stale() {
        let dir = tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 1, 1, 100).unwrap();

        let editor = cache.edit("k").unwrap().unwrap();
        cache.close().unwrap();
        // close aborted the edit, the editor no longer owns its entry
        assert!(matches!(
            editor.new_writer(0),
            Err(crate::CacheError::StaleEditor)
        ));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_writer_slot_bounds_are_checked() {
        let dir = tempdir().unwrap();
        let cache = BlobCache::open(dir.path(), 1, 2, 100).unwrap();
        let editor = cache.edit("k").unwrap().unwrap();
        let _ = editor.new_writer(2);
    }
}
