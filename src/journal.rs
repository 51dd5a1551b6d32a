//! Binary journal codec.
//!
//! The journal is an append-only log of entry state transitions, replayed
//! at open to rebuild the in-memory index. The stream starts with a fixed
//! header followed by records:
//!
//! ```text
//! +-------------------------------------------------------+
//! | magic (u64) | version (u8) | app_version (u32)        |
//! | value_count (u32) | 0x0A                              |
//! +-------------------------------------------------------+
//! | DIRTY  key                                       0x0A |
//! | CLEAN  key  len_0 .. len_{N-1}                   0x0A |
//! | REMOVE key                                       0x0A |
//! | READ   key                                       0x0A |
//! +-------------------------------------------------------+
//! ```
//!
//! Integers are big-endian. Strings are a u16 byte length followed by
//! modified UTF-8 (see [`crate::mutf8`]). Every record ends with a `\n`
//! byte that serves as a sanity terminator.
//!
//! Record semantics:
//!
//! - `DIRTY` marks an entry as actively being created or updated. Every
//!   `DIRTY` should be followed by a `CLEAN` or `REMOVE`; one without a
//!   match means temporary files may need to be deleted.
//! - `CLEAN` marks a successfully published entry, carrying the byte
//!   length of each of its values.
//! - `READ` tracks an access for LRU ordering.
//! - `REMOVE` marks a deleted entry.

use crate::mutf8;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// Magic number identifying a cache journal.
pub const MAGIC: u64 = 0x814A_4C45_0D0A_1A0A;

/// Journal format version.
pub const VERSION: u8 = 2;

/// Record terminator byte.
const TERMINATOR: u8 = b'\n';

const OP_CLEAN: u8 = 1;
const OP_DIRTY: u8 = 2;
const OP_REMOVE: u8 = 3;
const OP_READ: u8 = 4;

/// Journal header: identifies the format and pins the cache configuration.
///
/// A header whose `app_version` or `value_count` does not match the
/// opening cache is treated as corruption by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Application-supplied version stamped into the journal.
    pub app_version: u32,
    /// Number of value slots per entry.
    pub value_count: u32,
}

impl Header {
    /// Encoded size of the header in bytes.
    pub const SIZE: usize = 8 + 1 + 4 + 4 + 1;

    /// Encode the header.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u32(self.app_version);
        buf.put_u32(self.value_count);
        buf.put_u8(TERMINATOR);
        buf.freeze()
    }

    /// Decode and validate a header.
    pub fn decode(buf: &mut impl Buf) -> io::Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(corrupt("journal too small to contain a header"));
        }
        let magic = buf.get_u64();
        let version = buf.get_u8();
        let app_version = buf.get_u32();
        let value_count = buf.get_u32();
        let terminator = buf.get_u8();
        if magic != MAGIC {
            return Err(corrupt(format!("bad journal magic: {magic:#018x}")));
        }
        if version != VERSION {
            return Err(corrupt(format!(
                "unsupported journal version {version} (expected {VERSION})"
            )));
        }
        if terminator != TERMINATOR {
            return Err(corrupt("journal header missing terminator"));
        }
        Ok(Self {
            app_version,
            value_count,
        })
    }
}

/// One journal record: a single entry state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Entry published, with the byte length of every slot.
    Clean {
        /// Entry key.
        key: String,
        /// Published byte length of each slot.
        lengths: Vec<u64>,
    },
    /// Edit in progress on the entry.
    Dirty {
        /// Entry key.
        key: String,
    },
    /// Entry removed.
    Remove {
        /// Entry key.
        key: String,
    },
    /// Entry read, touching it for LRU ordering.
    Read {
        /// Entry key.
        key: String,
    },
}

impl Record {
    /// Encode the record for appending to the journal.
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] if the key's encoded
    /// form does not fit the u16 length prefix.
    pub fn encode(&self) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Self::Clean { key, lengths } => {
                buf.put_u8(OP_CLEAN);
                put_string(&mut buf, key)?;
                for len in lengths {
                    buf.put_u64(*len);
                }
            }
            Self::Dirty { key } => {
                buf.put_u8(OP_DIRTY);
                put_string(&mut buf, key)?;
            }
            Self::Remove { key } => {
                buf.put_u8(OP_REMOVE);
                put_string(&mut buf, key)?;
            }
            Self::Read { key } => {
                buf.put_u8(OP_READ);
                put_string(&mut buf, key)?;
            }
        }
        buf.put_u8(TERMINATOR);
        Ok(buf.freeze())
    }

    /// Decode the next record, or `None` at a clean end of input.
    ///
    /// End of input is only clean at a record boundary; a record cut short
    /// anywhere after its opcode is corruption.
    pub fn decode(buf: &mut impl Buf, value_count: usize) -> io::Result<Option<Self>> {
        if !buf.has_remaining() {
            return Ok(None);
        }
        let op = buf.get_u8();
        let key = get_string(buf)?;
        let record = match op {
            OP_CLEAN => {
                if buf.remaining() < value_count * 8 {
                    return Err(corrupt("truncated CLEAN record"));
                }
                let lengths = (0..value_count).map(|_| buf.get_u64()).collect();
                Self::Clean { key, lengths }
            }
            OP_DIRTY => Self::Dirty { key },
            OP_REMOVE => Self::Remove { key },
            OP_READ => Self::Read { key },
            other => return Err(corrupt(format!("unknown journal opcode {other}"))),
        };
        if !buf.has_remaining() || buf.get_u8() != TERMINATOR {
            return Err(corrupt("journal record missing terminator"));
        }
        Ok(Some(record))
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> io::Result<()> {
    let encoded = mutf8::encode(s);
    if encoded.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("key too long for journal: {} bytes", encoded.len()),
        ));
    }
    buf.put_u16(encoded.len() as u16);
    buf.put_slice(&encoded);
    Ok(())
}

fn get_string(buf: &mut impl Buf) -> io::Result<String> {
    if buf.remaining() < 2 {
        return Err(corrupt("truncated record: missing string length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(corrupt("truncated record: short string"));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    mutf8::decode(&bytes).map_err(|err| corrupt(err.to_string()))
}

fn corrupt<E>(reason: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, reason)
}
