//! Cache core: open and replay, the public operation surface, and journal
//! maintenance.
//!
//! All cache state lives in [`Inner`] behind a single mutex. Every
//! operation appends its journal record inside the same critical section
//! as the state change it records, so journal order always matches the
//! in-memory transition order. Bulk value I/O happens outside the lock,
//! through the writer and reader handles.

use crate::editor::Editor;
use crate::error::{CacheError, CacheResult};
use crate::fsutil;
use crate::index::{Entry, EntryIndex};
use crate::journal::{Header, Record};
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::paths;
use crate::snapshot::Snapshot;
use crate::trimmer::{self, Maintenance};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Rebuild the journal once this many redundant records have accumulated
/// (and the journal holds at least as many redundant records as live
/// entries, so a rebuild at least halves it).
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

/// Editor token attached to entries whose DIRTY record had no matching
/// CLEAN or REMOVE during replay. Live editors never get this token.
const REPLAY_EDITOR: u64 = 0;

/// Builder for [`BlobCache`].
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    directory: PathBuf,
    app_version: u32,
    value_count: usize,
    max_size: u64,
}

impl CacheBuilder {
    /// Create a builder for a cache rooted at `directory`.
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            app_version: 1,
            value_count: 1,
            max_size: 10 * 1024 * 1024,
        }
    }

    /// Application version stamped into the journal header.
    ///
    /// Opening a directory whose journal carries a different version
    /// discards the cache contents.
    pub fn app_version(mut self, app_version: u32) -> Self {
        self.app_version = app_version;
        self
    }

    /// Number of value slots per entry. Must be positive.
    pub fn value_count(mut self, value_count: usize) -> Self {
        self.value_count = value_count;
        self
    }

    /// Byte budget for the sum of published value lengths. Must be
    /// positive. The budget is soft: it may be exceeded while a background
    /// eviction is pending.
    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Open the cache, creating the directory and journal if needed.
    pub fn build(self) -> CacheResult<BlobCache> {
        if self.max_size == 0 {
            return Err(CacheError::InvalidConfig("max_size must be positive"));
        }
        if self.value_count == 0 {
            return Err(CacheError::InvalidConfig("value_count must be positive"));
        }
        BlobCache::open_with(self)
    }
}

/// State shared between the cache handle, its editors, and the
/// maintenance worker.
pub(crate) struct Shared {
    pub(crate) inner: Mutex<Inner>,
}

/// A bounded, filesystem-backed least-recently-used cache.
///
/// Each entry has a string key and a fixed number of values, opaque byte
/// sequences accessible as streams. The cache stores its data in a
/// directory that must be exclusive to it; an advisory lock enforces the
/// exclusivity while the cache is open.
///
/// ```text
///            get / edit / remove
///                    |
///            +-------v--------+     append     +-----------+
///            |  entry index   |--------------->|  journal  |
///            |  (LRU order)   |                | (replayed |
///            +-------+--------+                |  at open) |
///                    | schedule                +-----------+
///            +-------v--------+
///            |    trimmer     |  evicts LRU entries until
///            | (worker thread)|  size fits the byte budget
///            +----------------+
/// ```
///
/// The byte budget is not strict: the cache may temporarily exceed it
/// while the background trimmer catches up. The budget covers value bytes
/// only, not filesystem overhead or the journal.
///
/// Clients call [`edit`](Self::edit) to create or update an entry. An
/// entry has at most one editor at a time; a second concurrent `edit`
/// returns `None`. When an entry is being created, its first commit must
/// supply every value. When an entry is being updated, values without a
/// written slot keep their previous bytes. Committing is atomic: a read
/// observes the full set of values as they were before or after the
/// commit, never a mix.
///
/// Clients call [`get`](Self::get) to read a snapshot of an entry. The
/// read observes the values as of the call; later edits and removals do
/// not affect it.
pub struct BlobCache {
    shared: Arc<Shared>,
    metrics: Arc<CacheMetrics>,
    directory: PathBuf,
    max_size: u64,
    value_count: usize,
    trim_tx: Sender<Maintenance>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobCache")
            .field("directory", &self.directory)
            .field("max_size", &self.max_size)
            .field("value_count", &self.value_count)
            .finish()
    }
}

impl BlobCache {
    /// Builder for a cache rooted at `directory`.
    pub fn builder(directory: impl AsRef<Path>) -> CacheBuilder {
        CacheBuilder::new(directory)
    }

    /// Open the cache in `directory`, creating one if none exists there.
    ///
    /// `app_version` forms part of the journal header; `value_count` is
    /// the fixed number of values per entry; `max_size` is the soft byte
    /// budget. Both counts must be positive.
    pub fn open(
        directory: impl AsRef<Path>,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> CacheResult<Self> {
        CacheBuilder::new(directory)
            .app_version(app_version)
            .value_count(value_count)
            .max_size(max_size)
            .build()
    }

    fn open_with(config: CacheBuilder) -> CacheResult<Self> {
        let CacheBuilder {
            directory,
            app_version,
            value_count,
            max_size,
        } = config;

        fs::create_dir_all(&directory)?;
        let lock = match fsutil::lock_file(&directory.join(paths::LOCK_FILE)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(CacheError::DirectoryLocked);
            }
            Err(err) => return Err(err.into()),
        };

        let metrics = Arc::new(CacheMetrics::default());
        let (trim_tx, trim_rx) = crossbeam_channel::unbounded();
        let mut inner = Inner {
            directory: directory.clone(),
            app_version,
            value_count,
            max_size,
            size: 0,
            index: EntryIndex::new(),
            journal: None,
            redundant_op_count: 0,
            next_editor_token: REPLAY_EDITOR + 1,
            trim_tx: trim_tx.clone(),
            metrics: Arc::clone(&metrics),
            lock: Some(lock),
        };

        // prefer to pick up where we left off
        if directory.join(paths::JOURNAL_FILE).exists() {
            match inner.recover() {
                Ok(()) => {}
                Err(err) => {
                    warn!(
                        directory = %directory.display(),
                        error = %err,
                        "cache directory is corrupt, discarding contents"
                    );
                    metrics.record_recovery();
                    wipe_keeping_lock(&directory)?;
                    inner.reset();
                }
            }
        }
        if inner.journal.is_none() {
            // fresh journal, written to the side and renamed into place
            inner.rebuild_journal()?;
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(inner),
        });
        let worker = trimmer::spawn(Arc::clone(&shared), trim_rx);
        Ok(Self {
            shared,
            metrics,
            directory,
            max_size,
            value_count,
            trim_tx,
            worker: Some(worker),
        })
    }

    /// Snapshot of the entry named `key`, or `None` if it does not exist
    /// or is not currently readable. A returned entry is moved to the
    /// most recently used position.
    pub fn get(&self, key: &str) -> CacheResult<Option<Snapshot>> {
        self.shared.inner.lock().get(key)
    }

    /// Editor for the entry named `key`, or `None` if another edit is in
    /// progress on it.
    pub fn edit(&self, key: &str) -> CacheResult<Option<Editor>> {
        let mut inner = self.shared.inner.lock();
        inner.edit(&self.shared, key)
    }

    /// Drop the entry for `key` if it exists and can be removed. Entries
    /// actively being edited cannot be removed.
    ///
    /// Returns true if an entry was removed.
    pub fn remove(&self, key: &str) -> CacheResult<bool> {
        self.shared.inner.lock().remove(key)
    }

    /// Force buffered journal records to the filesystem, evicting down to
    /// the byte budget first.
    pub fn flush(&self) -> CacheResult<()> {
        self.shared.inner.lock().flush()
    }

    /// Close the cache. In-progress edits are aborted; stored values
    /// remain on the filesystem. Closing an already closed cache does
    /// nothing.
    pub fn close(&self) -> CacheResult<()> {
        let result = self.shared.inner.lock().close();
        let _ = self.trim_tx.send(Maintenance::Shutdown);
        result
    }

    /// Close the cache and delete everything in its directory, including
    /// files that were not created by the cache.
    pub fn delete(&self) -> CacheResult<()> {
        let result = self.shared.inner.lock().delete();
        let _ = self.trim_tx.send(Maintenance::Shutdown);
        result
    }

    /// The directory where this cache stores its data.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The soft byte budget for stored values.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of value slots per entry.
    pub fn value_count(&self) -> usize {
        self.value_count
    }

    /// Bytes currently used to store values. May exceed
    /// [`max_size`](Self::max_size) while a background eviction is
    /// pending.
    pub fn size(&self) -> u64 {
        self.shared.inner.lock().size
    }

    /// True once the cache has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().is_closed()
    }

    /// Point-in-time copy of the cache's operation counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for BlobCache {
    fn drop(&mut self) {
        let _ = self.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// All mutable cache state, guarded by the cache-wide mutex.
pub(crate) struct Inner {
    directory: PathBuf,
    app_version: u32,
    value_count: usize,
    max_size: u64,
    size: u64,
    index: EntryIndex,
    /// Append stream for the journal; `None` once the cache is closed.
    journal: Option<BufWriter<File>>,
    redundant_op_count: usize,
    next_editor_token: u64,
    trim_tx: Sender<Maintenance>,
    metrics: Arc<CacheMetrics>,
    /// Advisory lock on the directory, held while the cache is open.
    lock: Option<File>,
}

impl Inner {
    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.journal.is_none()
    }

    fn check_open(&self) -> CacheResult<()> {
        if self.is_closed() {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    /// Verify that `token` still owns the entry for `key`.
    pub(crate) fn check_editor(&self, key: &str, token: u64) -> CacheResult<()> {
        match self.index.peek(key) {
            Some(entry) if entry.current_editor == Some(token) => Ok(()),
            _ => Err(CacheError::StaleEditor),
        }
    }

    fn append(&mut self, record: &Record) -> CacheResult<()> {
        let encoded = record.encode()?;
        let stream = self.journal.as_mut().ok_or(CacheError::Closed)?;
        stream.write_all(&encoded)?;
        Ok(())
    }

    fn flush_journal(&mut self) -> CacheResult<()> {
        let stream = self.journal.as_mut().ok_or(CacheError::Closed)?;
        stream.flush()?;
        Ok(())
    }

    fn schedule_trim(&self) {
        let _ = self.trim_tx.send(Maintenance::Trim);
    }

    // ------------------------------------------------------------------
    // Open and replay
    // ------------------------------------------------------------------

    /// Replay the persisted journal and open it for appending. Any
    /// failure here means the directory contents cannot be trusted.
    fn recover(&mut self) -> CacheResult<()> {
        let records = self.replay_journal()?;
        self.process_journal()?;
        let file = OpenOptions::new()
            .append(true)
            .open(self.directory.join(paths::JOURNAL_FILE))?;
        self.journal = Some(BufWriter::new(file));
        self.redundant_op_count = records.saturating_sub(self.index.len());
        Ok(())
    }

    /// Read the journal into the index. Returns the number of records.
    fn replay_journal(&mut self) -> CacheResult<usize> {
        let data = fs::read(self.directory.join(paths::JOURNAL_FILE))?;
        let mut buf = &data[..];
        let header = Header::decode(&mut buf)?;
        if header.app_version != self.app_version
            || header.value_count != self.value_count as u32
        {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "journal header mismatch: [{}, {}] expected [{}, {}]",
                    header.app_version, header.value_count, self.app_version, self.value_count
                ),
            )));
        }
        let mut records = 0;
        while let Some(record) = Record::decode(&mut buf, self.value_count)? {
            self.apply(record);
            records += 1;
        }
        Ok(records)
    }

    fn apply(&mut self, record: Record) {
        match record {
            Record::Remove { key } => {
                self.index.remove(&key);
            }
            Record::Clean { key, lengths } => {
                self.touch_or_insert(&key);
                if let Some(entry) = self.index.peek_mut(&key) {
                    entry.lengths = lengths;
                    entry.readable = true;
                    entry.current_editor = None;
                }
            }
            Record::Dirty { key } => {
                self.touch_or_insert(&key);
                if let Some(entry) = self.index.peek_mut(&key) {
                    entry.current_editor = Some(REPLAY_EDITOR);
                }
            }
            Record::Read { key } => {
                // the lookup itself moves the entry to the recent end
                self.index.get(&key);
            }
        }
    }

    /// Fetch-or-create for replay; either way the key ends up most
    /// recently used, reproducing the access order the journal encodes.
    fn touch_or_insert(&mut self, key: &str) {
        if self.index.get(key).is_none() {
            self.index.put(key.to_owned(), Entry::new(self.value_count));
        }
    }

    /// Compute the initial size and collect garbage left by a crash.
    /// Entries with an unmatched DIRTY record are inconsistent: their
    /// files are deleted and the entry dropped.
    fn process_journal(&mut self) -> CacheResult<()> {
        fsutil::remove_if_exists(&self.directory.join(paths::JOURNAL_FILE_TMP))?;
        for key in self.index.keys_lru_first() {
            let dangling = match self.index.peek(&key) {
                Some(entry) => entry.current_editor.is_some(),
                None => continue,
            };
            if dangling {
                for slot in 0..self.value_count {
                    fsutil::remove_if_exists(&paths::clean_file(&self.directory, &key, slot))?;
                    fsutil::remove_if_exists(&paths::dirty_file(&self.directory, &key, slot))?;
                }
                self.index.remove(&key);
            } else if let Some(entry) = self.index.peek(&key) {
                self.size += entry.total_len();
            }
        }
        Ok(())
    }

    /// Reset in-memory state after the directory was wiped.
    fn reset(&mut self) {
        self.index = EntryIndex::new();
        self.size = 0;
        self.redundant_op_count = 0;
        self.journal = None;
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    fn get(&mut self, key: &str) -> CacheResult<Option<Snapshot>> {
        self.check_open()?;
        validate_key(key)?;
        match self.index.get(key) {
            Some(entry) if entry.readable => {}
            _ => {
                self.metrics.record_miss();
                return Ok(None);
            }
        }

        // open every reader eagerly so the snapshot captures one published
        // version; opened lazily they could come from different edits
        let mut files = Vec::with_capacity(self.value_count);
        for slot in 0..self.value_count {
            match File::open(paths::clean_file(&self.directory, key, slot)) {
                Ok(file) => files.push(file),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // a published file was deleted out from under us
                    self.metrics.record_miss();
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.redundant_op_count += 1;
        self.append(&Record::Read {
            key: key.to_owned(),
        })?;
        if self.journal_rebuild_required() {
            self.schedule_trim();
        }
        self.metrics.record_hit();
        Ok(Some(Snapshot::new(key.to_owned(), files)))
    }

    fn edit(&mut self, shared: &Arc<Shared>, key: &str) -> CacheResult<Option<Editor>> {
        self.check_open()?;
        validate_key(key)?;
        let exists = match self.index.get(key) {
            Some(entry) => {
                if entry.current_editor.is_some() {
                    return Ok(None);
                }
                true
            }
            None => false,
        };
        if !exists {
            self.index.put(key.to_owned(), Entry::new(self.value_count));
        }
        let token = self.next_editor_token;
        self.next_editor_token += 1;
        if let Some(entry) = self.index.peek_mut(key) {
            entry.current_editor = Some(token);
        }

        // journal the edit and flush before any dirty file can exist, so
        // an unmatched DIRTY is always detectable on replay
        self.append(&Record::Dirty {
            key: key.to_owned(),
        })?;
        self.flush_journal()?;
        Ok(Some(Editor::new(
            Arc::clone(shared),
            key.to_owned(),
            token,
            self.value_count,
        )))
    }

    fn remove(&mut self, key: &str) -> CacheResult<bool> {
        self.check_open()?;
        validate_key(key)?;
        let removed = self.remove_entry(key)?;
        if self.journal_rebuild_required() {
            self.schedule_trim();
        }
        Ok(removed)
    }

    /// Drop `key` if present and not being edited, deleting its value
    /// files. Returns whether an entry was removed.
    pub(crate) fn remove_entry(&mut self, key: &str) -> CacheResult<bool> {
        let lengths = match self.index.peek(key) {
            Some(entry) if entry.current_editor.is_none() => entry.lengths.clone(),
            _ => return Ok(false),
        };

        for slot in 0..self.value_count {
            fsutil::remove_if_exists(&paths::clean_file(&self.directory, key, slot))?;
            self.size -= lengths[slot];
        }

        self.redundant_op_count += 1;
        self.append(&Record::Remove {
            key: key.to_owned(),
        })?;
        self.index.remove(key);
        Ok(true)
    }

    /// Finish the edit identified by `token`, publishing or discarding
    /// its staged values.
    pub(crate) fn complete_edit(
        &mut self,
        key: &str,
        token: u64,
        success: bool,
    ) -> CacheResult<()> {
        let (readable, old_lengths) = match self.index.peek(key) {
            Some(entry) if entry.current_editor == Some(token) => {
                (entry.readable, entry.lengths.clone())
            }
            _ => return Err(CacheError::StaleEditor),
        };

        // a first-time publish must supply every value; a missing one
        // downgrades the commit to an abort
        let mut success = success;
        let mut missing_value = None;
        if success && !readable {
            for slot in 0..self.value_count {
                if !paths::dirty_file(&self.directory, key, slot).exists() {
                    missing_value = Some(slot);
                    success = false;
                    break;
                }
            }
        }

        let mut new_lengths = old_lengths.clone();
        for slot in 0..self.value_count {
            let dirty = paths::dirty_file(&self.directory, key, slot);
            if success {
                // slots without a staged file keep their previous value
                if dirty.exists() {
                    let clean = paths::clean_file(&self.directory, key, slot);
                    fs::rename(&dirty, &clean)?;
                    let new_len = fs::metadata(&clean)?.len();
                    self.size = self.size - old_lengths[slot] + new_len;
                    new_lengths[slot] = new_len;
                }
            } else {
                fsutil::remove_if_exists(&dirty)?;
            }
        }

        self.redundant_op_count += 1;
        if readable || success {
            if let Some(entry) = self.index.peek_mut(key) {
                entry.current_editor = None;
                entry.readable = true;
                entry.lengths = new_lengths.clone();
            }
            self.append(&Record::Clean {
                key: key.to_owned(),
                lengths: new_lengths,
            })?;
        } else {
            self.index.remove(key);
            self.append(&Record::Remove {
                key: key.to_owned(),
            })?;
        }

        if self.size > self.max_size || self.journal_rebuild_required() {
            self.schedule_trim();
        }

        match missing_value {
            Some(slot) => Err(CacheError::MissingValue(slot)),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> CacheResult<()> {
        self.check_open()?;
        self.trim_to_size()?;
        self.flush_journal()
    }

    fn close(&mut self) -> CacheResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let editing: Vec<(String, u64)> = self
            .index
            .keys_lru_first()
            .into_iter()
            .filter_map(|key| {
                let token = self.index.peek(&key)?.current_editor?;
                Some((key, token))
            })
            .collect();
        for (key, token) in editing {
            self.complete_edit(&key, token, false)?;
        }
        self.trim_to_size()?;
        if let Some(mut stream) = self.journal.take() {
            stream.flush()?;
        }
        self.lock = None;
        Ok(())
    }

    fn delete(&mut self) -> CacheResult<()> {
        self.close()?;
        fsutil::delete_contents(&self.directory)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Evict least recently used entries until the size fits the budget.
    /// Entries with a live editor are skipped; if only those remain the
    /// overshoot is left for a later cycle.
    pub(crate) fn trim_to_size(&mut self) -> CacheResult<()> {
        while self.size > self.max_size {
            let key = match self.index.eviction_candidate() {
                Some(key) => key.to_owned(),
                None => break,
            };
            let reclaimed = self.index.peek(&key).map(Entry::total_len).unwrap_or(0);
            if !self.remove_entry(&key)? {
                break;
            }
            self.metrics.record_eviction(reclaimed);
            debug!(key = %key, bytes = reclaimed, "evicted least recently used entry");
        }
        Ok(())
    }

    pub(crate) fn journal_rebuild_required(&self) -> bool {
        self.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD
            && self.redundant_op_count >= self.index.len()
    }

    /// Write a journal that omits redundant records, replacing the
    /// current one. The rename is the commit point; a rebuild is never
    /// partial.
    pub(crate) fn rebuild_journal(&mut self) -> CacheResult<()> {
        if let Some(mut stream) = self.journal.take() {
            stream.flush()?;
        }

        let tmp = self.directory.join(paths::JOURNAL_FILE_TMP);
        let mut out = BufWriter::new(File::create(&tmp)?);
        let header = Header {
            app_version: self.app_version,
            value_count: self.value_count as u32,
        };
        out.write_all(&header.encode())?;
        for key in self.index.keys_lru_first() {
            if let Some(entry) = self.index.peek(&key) {
                let record = if entry.current_editor.is_some() {
                    Record::Dirty { key: key.clone() }
                } else {
                    Record::Clean {
                        key: key.clone(),
                        lengths: entry.lengths.clone(),
                    }
                };
                out.write_all(&record.encode()?)?;
            }
        }
        out.flush()?;
        drop(out);

        let journal = self.directory.join(paths::JOURNAL_FILE);
        fs::rename(&tmp, &journal)?;
        self.journal = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&journal)?,
        ));
        self.redundant_op_count = 0;
        self.metrics.record_journal_rebuild();
        debug!(directory = %self.directory.display(), "journal rebuilt");
        Ok(())
    }
}

/// Keys appear directly in slot filenames and journal records: they must
/// be non-empty and contain no space, newline, or carriage return.
fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() || key.contains([' ', '\n', '\r']) {
        return Err(CacheError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

/// Delete the directory contents except the held lock file.
fn wipe_keeping_lock(directory: &Path) -> io::Result<()> {
    let lock = directory.join(paths::LOCK_FILE);
    for child in fs::read_dir(directory)? {
        let child = child?;
        let path = child.path();
        if path == lock {
            continue;
        }
        if child.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
