// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C4: scans the bounded byte source one PEB at a time and emits a
//! descriptor per physical erase block. Does not group blocks into
//! volumes or images — that is [`super::volume`]'s job.

use crate::config::Options;
use crate::crc;
use crate::error::{Error, Result};
use crate::io::FileByteSource;
use crate::ubi::headers::{self, EcHeader, VidHeader, VtblRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PebKind {
    /// Layout volume: valid VID header, non-empty volume table.
    Layout,
    /// Internal volume (id >= [`headers::UBI_INTERNAL_VOL_START`]) that isn't a layout block.
    Internal,
    /// Ordinary data volume (id < [`headers::UBI_INTERNAL_VOL_START`]).
    Data,
    /// No usable VID header (erased, unformatted, or CRC-failed in strict mode).
    Unknown,
}

/// Everything learned about one physical erase block.
#[derive(Debug, Clone)]
pub struct PebDescriptor {
    pub peb_num: u32,
    pub file_offset: u64,
    pub size: u32,
    pub ec_hdr: Option<EcHeader>,
    pub vid_hdr: Option<VidHeader>,
    pub vtbl: Vec<VtblRecord>,
    /// CRC-32 recomputed over the data region, for later freshness
    /// comparison against `vid_hdr.data_crc` (section 4.5, rule 2).
    pub data_crc: Option<u32>,
    pub kind: PebKind,
}

impl PebDescriptor {
    pub fn image_seq(&self) -> Option<u32> {
        self.ec_hdr.as_ref().map(|h| h.image_seq)
    }

    pub fn vol_id(&self) -> Option<u32> {
        self.vid_hdr.as_ref().map(|h| h.vol_id)
    }

    pub fn lnum(&self) -> Option<u32> {
        self.vid_hdr.as_ref().map(|h| h.lnum)
    }
}

/// Scans `src` block by block, returning one descriptor per PEB found
/// at or after the first occurrence of the `UBI#` magic.
///
/// Chunks before the first magic byte sequence are assumed to precede
/// the UBI area entirely (a bootloader, a partition table) and are
/// skipped without generating a descriptor, per section 4.4.
pub fn scan(src: &mut FileByteSource, opts: &Options) -> Result<Vec<PebDescriptor>> {
    let block_size = src.block_size();
    if block_size == 0 {
        return Err(Error::NoBlockSize);
    }

    let mut descriptors = Vec::new();
    let mut seen_first = false;
    let mut first_peb: u32 = 0;
    let mut index_since_first: u32 = 0;

    for item in src.blocks() {
        let (file_offset, chunk) = item?;
        let has_magic = chunk.starts_with(&headers::UBI_EC_HDR_MAGIC);

        if !has_magic {
            if !seen_first {
                first_peb += 1;
                continue;
            }
            descriptors.push(PebDescriptor {
                peb_num: first_peb + index_since_first,
                file_offset,
                size: block_size as u32,
                ec_hdr: None,
                vid_hdr: None,
                vtbl: Vec::new(),
                data_crc: None,
                kind: PebKind::Unknown,
            });
            index_since_first += 1;
            continue;
        }

        seen_first = true;
        let peb_num = first_peb + index_since_first;
        index_since_first += 1;

        match decode_one(&chunk, opts) {
            Ok(desc) => descriptors.push(PebDescriptor {
                peb_num,
                file_offset,
                size: block_size as u32,
                ..desc
            }),
            Err(e) if opts.warn_only_block_read_errors => {
                log::warn!("peb {peb_num} at {file_offset:#x}: {e}");
                descriptors.push(PebDescriptor {
                    peb_num,
                    file_offset,
                    size: block_size as u32,
                    ec_hdr: None,
                    vid_hdr: None,
                    vtbl: Vec::new(),
                    data_crc: None,
                    kind: PebKind::Unknown,
                });
            }
            Err(e) => return Err(e),
        }
    }

    Ok(descriptors)
}

/// Decodes one PEB-sized chunk that starts with the EC header magic.
/// `peb_num`/`file_offset`/`size` are filled in by the caller.
fn decode_one(chunk: &[u8], opts: &Options) -> Result<PebDescriptor> {
    let ec_hdr = EcHeader::parse(chunk)?;
    if !ec_hdr.crc_ok && !opts.ignore_block_header_errors {
        return Err(Error::Crc {
            what: "EC header",
            offset: 0,
            expected: ec_hdr.hdr_crc,
            actual: crc::flash_crc32(&chunk[0..60]),
        });
    }
    if !ec_hdr.offsets_sane(chunk.len() as u32) {
        return Err(Error::Parse {
            what: "EC header",
            reason: format!(
                "vid_hdr_offset {} / data_offset {} inconsistent with PEB size {}",
                ec_hdr.vid_hdr_offset,
                ec_hdr.data_offset,
                chunk.len()
            ),
        });
    }

    let vid_off = ec_hdr.vid_hdr_offset as usize;
    if vid_off + headers::VID_HDR_SZ > chunk.len()
        || chunk[vid_off..vid_off + 4] != headers::UBI_VID_HDR_MAGIC
    {
        // Free/erased PEB: EC header present, no VID header yet.
        return Ok(PebDescriptor {
            peb_num: 0,
            file_offset: 0,
            size: 0,
            ec_hdr: Some(ec_hdr),
            vid_hdr: None,
            vtbl: Vec::new(),
            data_crc: None,
            kind: PebKind::Unknown,
        });
    }

    let vid_hdr = VidHeader::parse(&chunk[vid_off..vid_off + headers::VID_HDR_SZ])?;
    if !vid_hdr.crc_ok && !opts.ignore_block_header_errors {
        return Err(Error::Crc {
            what: "VID header",
            offset: vid_off as u64,
            expected: vid_hdr.hdr_crc,
            actual: crc::flash_crc32(&chunk[vid_off..vid_off + 60]),
        });
    }

    let data_off = ec_hdr.data_offset as usize;
    let data_crc = if data_off <= chunk.len() {
        let data_len = (vid_hdr.data_size as usize).min(chunk.len() - data_off);
        Some(crc::flash_crc32(&chunk[data_off..data_off + data_len]))
    } else {
        None
    };

    let mut vtbl = Vec::new();
    if vid_hdr.is_layout_volume() && data_off < chunk.len() {
        vtbl = headers::parse_vtbl(&chunk[data_off..]);
    }

    let kind = if vid_hdr.is_layout_volume() && !vtbl.is_empty() {
        PebKind::Layout
    } else if vid_hdr.is_layout_volume() {
        PebKind::Internal
    } else {
        PebKind::Data
    };

    Ok(PebDescriptor {
        peb_num: 0,
        file_offset: 0,
        size: 0,
        ec_hdr: Some(ec_hdr),
        vid_hdr: Some(vid_hdr),
        vtbl,
        data_crc,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ubi::headers::test_support::*;
    use crate::ubi::headers::VolType;

    fn peb(ec_seq: u32, vol_id: u32, lnum: u32, sqnum: u64, peb_size: usize) -> Vec<u8> {
        let mut buf = build_ec_header(0, 64, 128, ec_seq);
        buf.resize(peb_size, 0xFF);
        let vid = build_vid_header(vol_id, lnum, sqnum, false, VolType::Dynamic);
        buf[64..64 + vid.len()].copy_from_slice(&vid);
        buf
    }

    #[test]
    fn decodes_data_peb() {
        let chunk = peb(1, 5, 2, 10, 1024);
        let desc = decode_one(&chunk, &Options::default()).unwrap();
        assert_eq!(desc.kind, PebKind::Data);
        assert_eq!(desc.vol_id(), Some(5));
        assert_eq!(desc.lnum(), Some(2));
    }

    #[test]
    fn decodes_layout_peb() {
        let mut chunk = peb(1, headers::UBI_INTERNAL_VOL_START, 0, 1, 4096);
        let rec = build_vtbl_record("rootfs", 10, VolType::Dynamic);
        chunk[128..128 + rec.len()].copy_from_slice(&rec);
        let desc = decode_one(&chunk, &Options::default()).unwrap();
        assert_eq!(desc.kind, PebKind::Layout);
        assert_eq!(desc.vtbl.len(), 1);
        assert_eq!(desc.vtbl[0].name, "rootfs");
    }

    #[test]
    fn strict_mode_rejects_crc_failure() {
        let mut chunk = peb(1, 5, 2, 10, 1024);
        chunk[8] ^= 0xFF; // corrupt ec field post-magic, pre-crc
        assert!(decode_one(&chunk, &Options::default()).is_err());
    }

    #[test]
    fn ignore_header_errors_accepts_bad_crc() {
        let mut chunk = peb(1, 5, 2, 10, 1024);
        chunk[8] ^= 0xFF;
        let mut opts = Options::default();
        opts.ignore_block_header_errors = true;
        let desc = decode_one(&chunk, &opts).unwrap();
        assert_eq!(desc.kind, PebKind::Data);
    }
}
