// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A random-access byte source bounded to `[start, end)` and
//! (optionally) block-aligned. Every other component reads through
//! this: the UBI block scanner steps it one PEB at a time, and the
//! LEB stream re-reads arbitrary offsets within a single PEB's data
//! region.

use crate::config::Options;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// A file opened read-only, bounded to `[start, end)`.
///
/// `start`/`end` are absolute file offsets; every method below takes
/// offsets relative to `start`. `end` is enforced on every read: a
/// read that would cross it is a [`Error::PastEnd`], not a short read.
pub struct FileByteSource {
    file: File,
    start: u64,
    end: u64,
    block_size: u64,
    last_read_offset: u64,
}

impl FileByteSource {
    /// Opens `path` and bounds it per `opts`. `opts.start_offset`
    /// defaults to 0 and `opts.end_offset` to the file's length.
    ///
    /// If `opts.block_size` is set, `(end - start) % block_size` must
    /// be zero unless `opts.warn_only_block_read_errors` is set, in
    /// which case misalignment is logged and tolerated.
    pub fn open(path: &Path, opts: &Options) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let start = opts.start_offset.unwrap_or(0);
        let end = opts.end_offset.unwrap_or(len);
        if start >= end || end > len {
            return Err(Error::Parse {
                what: "byte source bounds",
                reason: format!("start {start} end {end} file len {len}"),
            });
        }
        let block_size = opts.block_size.map(u64::from).unwrap_or(0);
        if block_size != 0 && (end - start) % block_size != 0 {
            if opts.warn_only_block_read_errors {
                log::warn!(
                    "source span {} is not a multiple of block size {block_size}",
                    end - start
                );
            } else {
                return Err(Error::Parse {
                    what: "byte source bounds",
                    reason: format!(
                        "span {} is not a multiple of block size {block_size}",
                        end - start
                    ),
                });
            }
        }
        Ok(Self {
            file,
            start,
            end,
            block_size,
            last_read_offset: 0,
        })
    }

    /// Length of the bounded region, in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Offset (relative to `start`) of the last completed read.
    pub fn last_read_offset(&self) -> u64 {
        self.last_read_offset
    }

    /// Reads exactly `buf.len()` bytes starting at `offset` (relative
    /// to `start`). A read that would cross `end` is a `PastEnd`
    /// error; a short physical read is a `ShortRead`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let span = self.end - self.start;
        let want_end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::PastEnd { offset, end: span })?;
        if want_end > span {
            return Err(Error::PastEnd { offset, end: span });
        }
        self.file.seek(SeekFrom::Start(self.start + offset))?;
        let got = read_fill(&mut self.file, buf)?;
        if got != buf.len() {
            return Err(Error::ShortRead {
                offset,
                wanted: buf.len(),
                got,
            });
        }
        self.last_read_offset = offset;
        Ok(())
    }

    /// Reads `len` bytes at `offset` into a freshly allocated buffer.
    pub fn read_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Iterates successive `block_size`-sized chunks from offset 0
    /// until `end`, pairing each with its starting offset. Used by the
    /// UBI block scanner (C4). A final partial chunk, if any, is
    /// dropped: a PEB can never be partially present in a well-formed
    /// image.
    pub fn blocks(&mut self) -> BlockIter<'_> {
        let block_size = self.block_size;
        BlockIter {
            src: self,
            next_offset: 0,
            block_size,
        }
    }
}

/// Reads until `buf` is full or the underlying reader is exhausted,
/// returning the number of bytes actually read. A plain `Read::read`
/// call may return short of a full buffer even when more data is
/// available, so we loop.
fn read_fill(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

pub struct BlockIter<'a> {
    src: &'a mut FileByteSource,
    next_offset: u64,
    block_size: u64,
}

impl<'a> Iterator for BlockIter<'a> {
    /// `(offset relative to start, block bytes)`.
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.src.end - self.src.start;
        if self.block_size == 0 || self.next_offset + self.block_size > span {
            return None;
        }
        let offset = self.next_offset;
        self.next_offset += self.block_size;
        Some(
            self.src
                .read_vec(offset, self.block_size as usize)
                .map(|buf| (offset, buf)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("ubidump-io-test-{name}"));
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn reads_within_bounds() {
        let path = write_tmp("bounds", b"0123456789");
        let mut opts = Options::default();
        opts.start_offset = Some(2);
        opts.end_offset = Some(8);
        let mut src = FileByteSource::open(&path, &opts).unwrap();
        assert_eq!(src.len(), 6);
        let buf = src.read_vec(0, 4).unwrap();
        assert_eq!(&buf, b"2345");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn read_past_end_errors() {
        let path = write_tmp("pastend", b"01234567");
        let mut opts = Options::default();
        opts.end_offset = Some(4);
        let mut src = FileByteSource::open(&path, &opts).unwrap();
        assert!(matches!(
            src.read_at(2, &mut [0u8; 4]),
            Err(Error::PastEnd { .. })
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn block_iteration_yields_aligned_chunks() {
        let path = write_tmp("blocks", &[0xAAu8; 16]);
        let mut opts = Options::default();
        opts.block_size = Some(4);
        let mut src = FileByteSource::open(&path, &opts).unwrap();
        let chunks: Vec<_> = src.blocks().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].0, 0);
        assert_eq!(chunks[3].0, 12);
        std::fs::remove_file(path).ok();
    }
}
