// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ingest-time configuration, mirroring section 6's option table
//! directly. `Options` carries no parsing logic of its own — the CLI
//! binary's `clap` parser is the only thing that builds one from
//! argv; everything under [`crate`] just consumes it.

use crate::ubi::headers::UBI_EC_HDR_MAGIC;
use crate::ubifs::node::UBIFS_NODE_MAGIC;

/// Which on-flash format the first four bytes at `start_offset` (or
/// `guess_offset`) are expected to name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Ubi,
    Ubifs,
}

/// Ingest-time knobs. All detection fields default to `None`/off, per
/// the "ambient configuration" rule: nothing here guesses unless asked
/// to.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// First byte of UBI/UBIFS data within the file.
    pub start_offset: Option<u64>,
    /// One past the last byte; must be block-aligned from `start_offset`.
    pub end_offset: Option<u64>,
    /// Hint used by magic-scanning auto-detect if `start_offset` is absent.
    pub guess_offset: Option<u64>,
    /// PEB (UBI) or LEB (UBIFS) size in bytes; auto-detected if absent.
    pub block_size: Option<u32>,
    /// `UBI` or `UBIFS`, for output selection; auto-detected if absent.
    pub image_type: Option<ImageType>,
    /// Switch failure mode from Strict to Warn (section 4.13).
    pub warn_only_block_read_errors: bool,
    /// Accept CRC-failed EC/VID headers as valid.
    pub ignore_block_header_errors: bool,
    /// Merge `image_seq == 0` blocks into every image (firmware workaround).
    pub uboot_fix: bool,
    /// Whether the emitter should preserve uid/gid/mode.
    pub permissions: bool,
    /// 64-byte AES key for encrypted UBIFS volumes; `None` leaves
    /// names and data passed through unchanged.
    pub master_key: Option<[u8; 64]>,
}

/// The two scanning heuristics from section 6: modal PEB-size delta
/// and the first superblock's `leb_size`.
pub mod autodetect {
    use super::*;

    /// PEB size is the most frequent delta between successive
    /// occurrences of the UBI magic bytes. Brittle on heavily
    /// fragmented images (open question (c) in the design notes);
    /// callers that know the block size should pass it explicitly.
    pub fn detect_block_size(data: &[u8]) -> Option<u32> {
        let offsets = find_all(data, &UBI_EC_HDR_MAGIC);
        if offsets.len() < 2 {
            return None;
        }
        let mut deltas = std::collections::HashMap::new();
        for w in offsets.windows(2) {
            let delta = w[1] - w[0];
            if delta > 0 {
                *deltas.entry(delta).or_insert(0u32) += 1;
            }
        }
        deltas
            .into_iter()
            .max_by_key(|&(_, count)| count)
            .map(|(delta, _)| delta as u32)
    }

    /// Scans for the UBIFS node magic and, on the first match whose
    /// common header names a superblock node, decodes the body just
    /// far enough to read `leb_size`. Does not validate the node's CRC
    /// — this is a best-effort hint, not a substitute for
    /// [`crate::ubifs::Instance::open`].
    pub fn detect_leb_size(data: &[u8]) -> Option<u32> {
        const COMMON_HDR_SZ: usize = 24;
        const SB_NODE_TYPE: u8 = 6;
        // leb_size sits 8 bytes into the superblock body: 2 bytes
        // padding, 1 byte key_hash, 1 byte key_fmt, 4 bytes flags,
        // 4 bytes min_io_size, then 4 bytes leb_size.
        const LEB_SIZE_OFFSET_IN_BODY: usize = 2 + 1 + 1 + 4 + 4;

        for offset in find_all(data, &UBIFS_NODE_MAGIC) {
            let offset = offset as usize;
            let hdr_end = offset + COMMON_HDR_SZ;
            if hdr_end > data.len() {
                continue;
            }
            // node_type is the common header's 21st byte (magic 0-3,
            // crc 4-7, sqnum 8-15, len 16-19, type 20).
            let node_type = data[offset + 20];
            if node_type != SB_NODE_TYPE {
                continue;
            }
            let field_start = hdr_end + LEB_SIZE_OFFSET_IN_BODY;
            if field_start + 4 > data.len() {
                continue;
            }
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[field_start..field_start + 4]);
            return Some(u32::from_le_bytes(raw));
        }
        None
    }

    /// File type is decided by the first four bytes at `start_offset`.
    pub fn detect_image_type(data: &[u8]) -> Option<ImageType> {
        if data.starts_with(&UBI_EC_HDR_MAGIC) {
            Some(ImageType::Ubi)
        } else if data.starts_with(&UBIFS_NODE_MAGIC) {
            Some(ImageType::Ubifs)
        } else {
            None
        }
    }

    /// Finds where the UBI/UBIFS area actually starts when `start_offset`
    /// wasn't given outright: the nearest occurrence of either magic at
    /// or after `guess_offset` (0 if the caller has no hint at all).
    /// Searching forward from the hint rather than the whole file lets a
    /// caller who knows roughly where the area begins (a known partition
    /// table entry, a prior failed attempt) skip over leading data that
    /// happens to contain the same four magic bytes by coincidence.
    pub fn detect_start_offset(data: &[u8], guess_offset: Option<u64>) -> Option<u64> {
        let from = guess_offset.unwrap_or(0).min(data.len() as u64) as usize;
        let tail = &data[from..];
        let ubi = find_all(tail, &UBI_EC_HDR_MAGIC).into_iter().next();
        let ubifs = find_all(tail, &UBIFS_NODE_MAGIC).into_iter().next();
        [ubi, ubifs]
            .into_iter()
            .flatten()
            .min()
            .map(|offset| offset + from as u64)
    }

    fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<u64> {
        let mut out = Vec::new();
        if needle.is_empty() || haystack.len() < needle.len() {
            return out;
        }
        let mut i = 0;
        while i + needle.len() <= haystack.len() {
            if &haystack[i..i + needle.len()] == needle {
                out.push(i as u64);
            }
            i += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_detect_everything() {
        let opts = Options::default();
        assert!(opts.start_offset.is_none());
        assert!(opts.block_size.is_none());
        assert!(!opts.warn_only_block_read_errors);
    }

    #[test]
    fn detects_modal_peb_delta() {
        let mut data = vec![0u8; 0];
        for _ in 0..3 {
            data.extend_from_slice(&UBI_EC_HDR_MAGIC);
            data.extend(std::iter::repeat(0u8).take(60));
        }
        assert_eq!(autodetect::detect_block_size(&data), Some(64));
    }

    #[test]
    fn start_offset_honors_guess_hint() {
        let mut data = vec![0xAAu8; 16];
        data.extend_from_slice(&UBI_EC_HDR_MAGIC); // a decoy at offset 16
        data.extend_from_slice(&[0u8; 4]);
        data.extend_from_slice(&UBI_EC_HDR_MAGIC); // the real one at offset 24
        assert_eq!(autodetect::detect_start_offset(&data, None), Some(16));
        assert_eq!(autodetect::detect_start_offset(&data, Some(20)), Some(24));
    }

    #[test]
    fn detects_image_type_from_magic() {
        assert_eq!(
            autodetect::detect_image_type(&UBI_EC_HDR_MAGIC),
            Some(ImageType::Ubi)
        );
        assert_eq!(
            autodetect::detect_image_type(&UBIFS_NODE_MAGIC),
            Some(ImageType::Ubifs)
        );
        assert_eq!(autodetect::detect_image_type(b"nope"), None);
    }
}
