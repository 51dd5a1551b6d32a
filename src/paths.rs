//! On-disk layout of a cache directory.
//!
//! A cache directory contains the journal, its rebuild temporary, an
//! advisory lock file, and two files per entry slot:
//!
//! ```text
//! <dir>/journal        append-only record log
//! <dir>/journal.tmp    staging file for journal rebuilds
//! <dir>/lock           advisory lock, held while the cache is open
//! <dir>/<key>.<i>      published (clean) value for slot i
//! <dir>/<key>.<i>.tmp  in-progress (dirty) value for slot i
//! ```
//!
//! Path construction is pure; nothing here touches the filesystem.

use std::path::{Path, PathBuf};

/// Name of the journal file inside a cache directory.
pub const JOURNAL_FILE: &str = "journal";

/// Name of the temporary file used while rebuilding the journal.
pub const JOURNAL_FILE_TMP: &str = "journal.tmp";

/// Name of the advisory lock file inside a cache directory.
pub const LOCK_FILE: &str = "lock";

/// Path of the published value file for `key` slot `slot`.
pub fn clean_file(dir: &Path, key: &str, slot: usize) -> PathBuf {
    dir.join(format!("{key}.{slot}"))
}

/// Path of the in-progress value file for `key` slot `slot`.
pub fn dirty_file(dir: &Path, key: &str, slot: usize) -> PathBuf {
    dir.join(format!("{key}.{slot}.tmp"))
}
