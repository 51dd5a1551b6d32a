//! Read-side handle onto one published version of an entry.

use std::fs::File;
use std::io::{self, Read};

/// An open reader for a single value slot.
///
/// The reader stays valid even if the entry is later edited or removed: it
/// was opened against the published file of the version the snapshot
/// captured, and the open descriptor keeps that data reachable.
#[derive(Debug)]
pub struct SlotReader {
    file: File,
}

impl Read for SlotReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// A snapshot of the values of one entry.
///
/// All slot readers are opened eagerly when the snapshot is taken, so
/// every slot belongs to the same published version. Updates and removals
/// after the snapshot was taken do not affect it. Dropping the snapshot
/// releases the readers.
#[derive(Debug)]
pub struct Snapshot {
    key: String,
    readers: Vec<SlotReader>,
}

impl Snapshot {
    pub(crate) fn new(key: String, files: Vec<File>) -> Self {
        Self {
            key,
            readers: files.into_iter().map(|file| SlotReader { file }).collect(),
        }
    }

    /// The key this snapshot was taken for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of value slots.
    pub fn value_count(&self) -> usize {
        self.readers.len()
    }

    /// Reader for the value at `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn reader(&mut self, slot: usize) -> &mut SlotReader {
        &mut self.readers[slot]
    }

    /// Read the rest of the value at `slot` into an owned buffer.
    pub fn read_to_vec(&mut self, slot: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader(slot).read_to_end(&mut buf)?;
        Ok(buf)
    }
}
