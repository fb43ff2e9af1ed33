// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed big-endian layouts for the three UBI on-flash structures: the
//! erase-count header, the volume-ID header, and a volume-table
//! record. Layouts follow the upstream kernel's `ubi-media.h`, bit for
//! bit (section 6's "on-flash layout" table).
//!
//! Every `parse` function decodes the full fixed-size buffer and
//! reports whether the trailing CRC matched, rather than erroring out
//! on mismatch: the caller (the block scanner, C4) is the one that
//! knows whether the run is in strict or warn-only mode.

use crate::crc;
use crate::error::{Error, Result};

pub const UBI_EC_HDR_MAGIC: [u8; 4] = *b"UBI#";
pub const UBI_VID_HDR_MAGIC: [u8; 4] = *b"UBI!";

pub const EC_HDR_SZ: usize = 64;
pub const VID_HDR_SZ: usize = 64;
pub const VTBL_REC_SZ: usize = 172;
pub const UBI_MAX_VOLUMES: usize = 128;

/// Volume ids at or above this are internal (layout volume, or a
/// future reserved use); ids below it are ordinary data volumes.
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_EFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolType {
    Dynamic,
    Static,
}

impl VolType {
    fn from_raw(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Dynamic),
            2 => Some(Self::Static),
            _ => None,
        }
    }
}

/// Erase-count header (64 bytes, big-endian), present at offset 0 of
/// every PEB.
#[derive(Debug, Clone)]
pub struct EcHeader {
    pub version: u8,
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
    pub hdr_crc: u32,
    pub crc_ok: bool,
}

impl EcHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < EC_HDR_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: EC_HDR_SZ,
                got: buf.len(),
            });
        }
        if &buf[0..4] != UBI_EC_HDR_MAGIC {
            return Err(Error::BadMagic {
                offset: 0,
                expected: &[0x55, 0x42, 0x49, 0x23],
                got: buf[0..4].to_vec(),
            });
        }
        let version = buf[4];
        let ec = be_u64(buf, 8);
        let vid_hdr_offset = be_u32(buf, 16);
        let data_offset = be_u32(buf, 20);
        let image_seq = be_u32(buf, 24);
        let hdr_crc = be_u32(buf, 60);
        let crc_ok = crc::flash_crc32(&buf[0..60]) == hdr_crc;
        Ok(Self {
            version,
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            hdr_crc,
            crc_ok,
        })
    }

    /// Section 3's PEB invariant: `vid_hdr_offset + 64 <= data_offset <= PEB size`.
    pub fn offsets_sane(&self, peb_size: u32) -> bool {
        self.vid_hdr_offset.saturating_add(VID_HDR_SZ as u32) <= self.data_offset
            && self.data_offset <= peb_size
    }
}

/// Volume-ID header (64 bytes, big-endian), at the EC header's
/// `vid_hdr_offset`.
#[derive(Debug, Clone)]
pub struct VidHeader {
    pub version: u8,
    pub vol_type: Option<VolType>,
    pub copy_flag: bool,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub sqnum: u64,
    pub hdr_crc: u32,
    pub crc_ok: bool,
}

impl VidHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < VID_HDR_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: VID_HDR_SZ,
                got: buf.len(),
            });
        }
        if &buf[0..4] != UBI_VID_HDR_MAGIC {
            return Err(Error::BadMagic {
                offset: 0,
                expected: &[0x55, 0x42, 0x49, 0x21],
                got: buf[0..4].to_vec(),
            });
        }
        let version = buf[4];
        let vol_type = VolType::from_raw(buf[5]);
        let copy_flag = buf[6] != 0;
        let compat = buf[7];
        let vol_id = be_u32(buf, 8);
        let lnum = be_u32(buf, 12);
        let data_size = be_u32(buf, 20);
        let used_ebs = be_u32(buf, 24);
        let data_pad = be_u32(buf, 28);
        let data_crc = be_u32(buf, 32);
        let sqnum = be_u64(buf, 40);
        let hdr_crc = be_u32(buf, 60);
        let crc_ok = crc::flash_crc32(&buf[0..60]) == hdr_crc;
        Ok(Self {
            version,
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            hdr_crc,
            crc_ok,
        })
    }

    pub fn is_layout_volume(&self) -> bool {
        self.vol_id >= UBI_INTERNAL_VOL_START
    }
}

/// One slot of the volume table: up to [`UBI_MAX_VOLUMES`] of these
/// live in a layout volume's data region.
#[derive(Debug, Clone)]
pub struct VtblRecord {
    pub rec_index: usize,
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub vol_type: Option<VolType>,
    pub upd_marker: bool,
    pub name_len: u16,
    pub name: String,
    pub flags: u8,
    pub crc_ok: bool,
}

impl VtblRecord {
    /// Decodes one 172-byte record. A zero `name_len` is an empty slot
    /// and is reported, not errored: section 4.2 says to "reject
    /// records whose `name_len` is zero... without raising an error".
    fn parse(buf: &[u8], rec_index: usize) -> Result<Self> {
        if buf.len() < VTBL_REC_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: VTBL_REC_SZ,
                got: buf.len(),
            });
        }
        let reserved_pebs = be_u32(buf, 0);
        let alignment = be_u32(buf, 4);
        let data_pad = be_u32(buf, 8);
        let vol_type = VolType::from_raw(buf[12]);
        let upd_marker = buf[13] != 0;
        let name_len = be_u16(buf, 14);
        let name_buf = &buf[16..16 + 128];
        let n = (name_len as usize).min(128);
        let name = String::from_utf8_lossy(&name_buf[..n]).into_owned();
        let flags = buf[144];
        let crc = be_u32(buf, 168);
        let crc_ok = crc::flash_crc32(&buf[0..168]) == crc;
        Ok(Self {
            rec_index,
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name_len,
            name,
            flags,
            crc_ok,
        })
    }

    pub fn is_empty_slot(&self) -> bool {
        self.name_len == 0
    }
}

/// Parses up to [`UBI_MAX_VOLUMES`] volume-table records out of a
/// layout volume's data region, dropping empty slots and CRC-failed
/// records (matching the reference reader's `vtbl_recs`).
pub fn parse_vtbl(data: &[u8]) -> Vec<VtblRecord> {
    let mut out = Vec::new();
    for i in 0..UBI_MAX_VOLUMES {
        let offset = i * VTBL_REC_SZ;
        if offset + VTBL_REC_SZ > data.len() {
            break;
        }
        match VtblRecord::parse(&data[offset..offset + VTBL_REC_SZ], i) {
            Ok(rec) if rec.crc_ok && !rec.is_empty_slot() => out.push(rec),
            Ok(_) => {}
            Err(e) => log::debug!("vtbl record {i}: {e}"),
        }
    }
    out
}

fn be_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(buf[off..off + 2].try_into().unwrap())
}

fn be_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn be_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Builds a valid, CRC-correct EC header for use as a test
    /// fixture.
    pub fn build_ec_header(ec: u64, vid_hdr_offset: u32, data_offset: u32, image_seq: u32) -> Vec<u8> {
        let mut buf = vec![0u8; EC_HDR_SZ];
        buf[0..4].copy_from_slice(&UBI_EC_HDR_MAGIC);
        buf[4] = 1; // version
        buf[8..16].copy_from_slice(&ec.to_be_bytes());
        buf[16..20].copy_from_slice(&vid_hdr_offset.to_be_bytes());
        buf[20..24].copy_from_slice(&data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&image_seq.to_be_bytes());
        let crc = crc::flash_crc32(&buf[0..60]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn build_vid_header(
        vol_id: u32,
        lnum: u32,
        sqnum: u64,
        copy_flag: bool,
        vol_type: VolType,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; VID_HDR_SZ];
        buf[0..4].copy_from_slice(&UBI_VID_HDR_MAGIC);
        buf[4] = 1;
        buf[5] = match vol_type {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        };
        buf[6] = copy_flag as u8;
        buf[8..12].copy_from_slice(&vol_id.to_be_bytes());
        buf[12..16].copy_from_slice(&lnum.to_be_bytes());
        buf[40..48].copy_from_slice(&sqnum.to_be_bytes());
        let crc = crc::flash_crc32(&buf[0..60]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn build_vtbl_record(name: &str, reserved_pebs: u32, vol_type: VolType) -> Vec<u8> {
        let mut buf = vec![0u8; VTBL_REC_SZ];
        buf[0..4].copy_from_slice(&reserved_pebs.to_be_bytes());
        buf[12] = match vol_type {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        };
        buf[14..16].copy_from_slice(&(name.len() as u16).to_be_bytes());
        buf[16..16 + name.len()].copy_from_slice(name.as_bytes());
        let crc = crc::flash_crc32(&buf[0..168]);
        buf[168..172].copy_from_slice(&crc.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn ec_header_round_trips() {
        let buf = build_ec_header(5, 64, 128, 0xAAAA);
        let hdr = EcHeader::parse(&buf).unwrap();
        assert!(hdr.crc_ok);
        assert_eq!(hdr.ec, 5);
        assert_eq!(hdr.vid_hdr_offset, 64);
        assert_eq!(hdr.data_offset, 128);
        assert_eq!(hdr.image_seq, 0xAAAA);
        assert!(hdr.offsets_sane(131072));
    }

    #[test]
    fn ec_header_rejects_bad_magic() {
        let mut buf = build_ec_header(0, 64, 128, 0);
        buf[0] = 0;
        assert!(matches!(EcHeader::parse(&buf), Err(Error::BadMagic { .. })));
    }

    #[test]
    fn ec_header_detects_crc_mismatch() {
        let mut buf = build_ec_header(0, 64, 128, 0);
        buf[8] ^= 0xFF;
        let hdr = EcHeader::parse(&buf).unwrap();
        assert!(!hdr.crc_ok);
    }

    #[test]
    fn vid_header_round_trips() {
        let buf = build_vid_header(0, 7, 99, false, VolType::Dynamic);
        let hdr = VidHeader::parse(&buf).unwrap();
        assert!(hdr.crc_ok);
        assert_eq!(hdr.lnum, 7);
        assert_eq!(hdr.sqnum, 99);
        assert!(!hdr.is_layout_volume());
    }

    #[test]
    fn layout_volume_detected_by_id() {
        let buf = build_vid_header(UBI_INTERNAL_VOL_START, 0, 0, false, VolType::Dynamic);
        let hdr = VidHeader::parse(&buf).unwrap();
        assert!(hdr.is_layout_volume());
    }

    #[test]
    fn vtbl_skips_empty_and_keeps_named_slots() {
        let mut data = Vec::new();
        data.extend(build_vtbl_record("rootfs", 64, VolType::Dynamic));
        data.extend(vec![0u8; VTBL_REC_SZ]); // empty slot, name_len 0
        let recs = parse_vtbl(&data);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].name, "rootfs");
        assert_eq!(recs[0].reserved_pebs, 64);
    }
}
