// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A flat, fully-enumerated error type. Every failure mode gets its
//! own variant rather than a single opaque message, since callers
//! (the volume assembler, the index walker) need to match on which
//! invariant failed to decide whether to warn-and-continue or abort.

use std::fmt;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("read past end of bounded source (offset {offset}, end {end})")]
    PastEnd { offset: u64, end: u64 },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic at offset {offset}: expected {expected:?}, got {got:?}")]
    BadMagic {
        offset: u64,
        expected: &'static [u8],
        got: Vec<u8>,
    },

    #[error("CRC mismatch in {what} at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    Crc {
        what: &'static str,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("malformed {what}: {reason}")]
    Parse {
        what: &'static str,
        reason: String,
    },

    #[error("decompression failed for {codec}: {reason}")]
    Decode { codec: &'static str, reason: String },

    #[error("no valid UBIFS master node in either slot")]
    NoMaster,

    #[error("no UBIFS superblock node found")]
    NoSuperblock,

    #[error("dangling directory entry: inode {inum} has no inode node")]
    DanglingDent { inum: u32 },

    #[error("cyclic hard link detected at inode {inum}")]
    CyclicLink { inum: u32 },

    #[error("path escapes emitter root: {path}")]
    PathEscape { path: String },

    #[error("unknown compression type {0}")]
    UnknownCompression(u8),

    #[error("unknown node type {0}")]
    UnknownNodeType(u8),

    #[error("no block size could be detected; pass Options::block_size")]
    NoBlockSize,

    #[error("encrypted volume but no master_key configured")]
    MissingKey,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal warnings collected during a walk, independent of the
/// `log` output — so a caller can inspect them programmatically.
#[derive(Debug, Clone)]
pub struct Warning {
    pub peb: Option<u32>,
    pub leb: Option<u32>,
    pub offset: Option<u64>,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(p) = self.peb {
            write!(f, " (peb {p})")?;
        }
        if let Some(l) = self.leb {
            write!(f, " (leb {l})")?;
        }
        if let Some(o) = self.offset {
            write!(f, " (offset {o})")?;
        }
        Ok(())
    }
}
