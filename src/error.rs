//! Error types for cache operations.

use std::fmt;
use std::io;

/// Errors that can occur during cache operations.
#[derive(Debug)]
pub enum CacheError {
    /// The cache has been closed and rejects further operations.
    Closed,

    /// The cache directory is already locked by another cache instance.
    DirectoryLocked,

    /// Invalid configuration was supplied at open time.
    InvalidConfig(&'static str),

    /// The key is empty or contains a space, newline, or carriage return.
    InvalidKey(String),

    /// The editor no longer owns its entry: the edit was already completed,
    /// or the cache was closed and aborted it.
    StaleEditor,

    /// A first-time commit did not supply a value for the given slot.
    MissingValue(usize),

    /// An I/O error from the filesystem or the journal stream.
    Io(io::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "cache is closed"),
            Self::DirectoryLocked => write!(f, "cache directory is locked by another instance"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::InvalidKey(key) => {
                write!(f, "keys must not be empty or contain spaces or newlines: {key:?}")
            }
            Self::StaleEditor => write!(f, "editor is no longer current for its entry"),
            Self::MissingValue(slot) => {
                write!(f, "edit did not create a value for slot {slot}")
            }
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
