//! blobcache: a bounded, filesystem-backed LRU cache for opaque byte
//! blobs.
//!
//! Each cache entry has a string key and a fixed number of values,
//! accessible as byte streams. Entries are created and updated through an
//! atomic multi-slot edit protocol, reads observe a consistent published
//! version, and a background worker evicts least recently used entries to
//! honor a byte budget. The cache survives restarts by replaying an
//! append-only journal of state transitions, which is periodically
//! compacted.
//!
//! # Architecture
//!
//! ```text
//! +------------------------------------------------------+
//! |                      BlobCache                       |
//! |  +-------------+  +-----------+  +----------------+  |
//! |  | EntryIndex  |  |  Journal  |  |    Trimmer     |  |
//! |  | (LRU order) |  | (replay + |  | (worker thread)|  |
//! |  |             |  |  append)  |  |                |  |
//! |  +-------------+  +-----------+  +----------------+  |
//! +------------------------------------------------------+
//!          |                 |
//!          v                 v
//!   +-------------+   +-----------------------+
//!   |  Editor /   |   |     Cache directory   |
//!   |  Snapshot   |   |  journal, lock,       |
//!   | (handles)   |   |  <key>.<i> files      |
//!   +-------------+   +-----------------------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use blobcache::BlobCache;
//! use std::io::Write;
//!
//! let cache = BlobCache::open("/var/cache/thumbs", 1, 2, 64 * 1024 * 1024)?;
//!
//! if let Some(editor) = cache.edit("a1b2c3")? {
//!     editor.new_writer(0)?.write_all(&thumbnail)?;
//!     editor.new_writer(1)?.write_all(&metadata)?;
//!     editor.commit()?;
//! }
//!
//! if let Some(mut snapshot) = cache.get("a1b2c3")? {
//!     let thumbnail = snapshot.read_to_vec(0)?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
mod editor;
mod error;
mod fsutil;
mod index;
mod journal;
mod metrics;
mod mutf8;
mod paths;
mod snapshot;
mod trimmer;

pub use cache::{BlobCache, CacheBuilder};
pub use editor::{Editor, SlotWriter};
pub use error::{CacheError, CacheResult};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use snapshot::{Snapshot, SlotReader};
