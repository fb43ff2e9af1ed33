// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C8: fixed little-endian layouts for the UBIFS common header and the
//! node bodies the walker needs (superblock, master, index, inode,
//! data, dent/xent, pad). Layouts follow the upstream kernel's
//! `ubifs-media.h` (section 6's "on-flash layout" table), decoded the
//! same way [`crate::ubi::headers`] decodes the UBI side: fixed-offset
//! field reads plus a stored `crc_ok` rather than an error on mismatch.

use crate::compress::Compression;
use crate::crc;
use crate::error::{Error, Result};

pub const UBIFS_NODE_MAGIC: [u8; 4] = *b"\x31\x18\x10\x06";

pub const COMMON_HDR_SZ: usize = 24;
pub const SB_NODE_SZ: usize = 4072;
pub const MST_NODE_SZ: usize = 488;
pub const BRANCH_SZ: usize = 20;
pub const IDX_NODE_FIXED_SZ: usize = 8;
pub const INO_NODE_SZ: usize = 136;
pub const DENT_NODE_SZ: usize = 32;
pub const DATA_NODE_SZ: usize = 24;
/// On-flash key fields are padded to this width even though the simple
/// key format (the only one this crate decodes) only uses the first 8.
const ON_FLASH_KEY_SZ: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Ino,
    Data,
    Dent,
    Xent,
    Trun,
    Pad,
    Sb,
    Mst,
    Ref,
    Idx,
    Cs,
    Orph,
}

impl NodeType {
    pub fn from_raw(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Ino,
            1 => Self::Data,
            2 => Self::Dent,
            3 => Self::Xent,
            4 => Self::Trun,
            5 => Self::Pad,
            6 => Self::Sb,
            7 => Self::Mst,
            8 => Self::Ref,
            9 => Self::Idx,
            10 => Self::Cs,
            11 => Self::Orph,
            other => return Err(Error::UnknownNodeType(other)),
        })
    }
}

/// The 24-byte prefix on every UBIFS node.
#[derive(Debug, Clone)]
pub struct CommonHeader {
    pub crc: u32,
    pub sqnum: u64,
    pub len: u32,
    pub node_type: u8,
    pub group_type: u8,
}

impl CommonHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < COMMON_HDR_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: COMMON_HDR_SZ,
                got: buf.len(),
            });
        }
        if buf[0..4] != UBIFS_NODE_MAGIC {
            return Err(Error::BadMagic {
                offset: 0,
                expected: &[0x31, 0x18, 0x10, 0x06],
                got: buf[0..4].to_vec(),
            });
        }
        Ok(Self {
            crc: le_u32(buf, 4),
            sqnum: le_u64(buf, 8),
            len: le_u32(buf, 16),
            node_type: buf[20],
            group_type: buf[21],
        })
    }

    /// CRC covers everything from `sqnum` onward: the rest of the
    /// header plus the whole body, excluding the magic and the CRC
    /// field itself. `whole_node` must be at least `self.len` bytes.
    pub fn crc_ok(&self, whole_node: &[u8]) -> bool {
        let len = self.len as usize;
        if len < 8 || len > whole_node.len() {
            return false;
        }
        crc::flash_crc32(&whole_node[8..len]) == self.crc
    }
}

/// A key as stored in an inode, data, dent, or xent node: inode number
/// in the key's first four bytes, block hash and 3-bit type packed
/// into the next four. Corrects the reference reader's `parse_key`,
/// which masks `ino_num` by the 29-bit hash mask (always zero for
/// normal-range inode numbers above 2^29) and leaves the type bits set
/// in `khash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    pub inum: u32,
    pub ktype: u8,
    pub hash: u32,
}

const KEY_HASH_MASK: u32 = 0x1FFF_FFFF;
const KEY_BLOCK_BITS: u32 = 29;

pub const KEY_TYPE_INO: u8 = 0;
pub const KEY_TYPE_DATA: u8 = 1;
pub const KEY_TYPE_DENT: u8 = 2;
pub const KEY_TYPE_XENT: u8 = 3;

impl Key {
    pub fn parse(buf: &[u8]) -> Self {
        let inum = le_u32(buf, 0);
        let raw = le_u32(buf, 4);
        Key {
            inum,
            ktype: (raw >> KEY_BLOCK_BITS) as u8,
            hash: raw & KEY_HASH_MASK,
        }
    }

    #[cfg(test)]
    pub fn encode(&self) -> [u8; ON_FLASH_KEY_SZ] {
        let mut buf = [0u8; ON_FLASH_KEY_SZ];
        buf[0..4].copy_from_slice(&self.inum.to_le_bytes());
        let raw = ((self.ktype as u32) << KEY_BLOCK_BITS) | (self.hash & KEY_HASH_MASK);
        buf[4..8].copy_from_slice(&raw.to_le_bytes());
        buf
    }
}

#[derive(Debug, Clone)]
pub struct SuperblockNode {
    pub key_hash: u8,
    pub key_fmt: u8,
    pub flags: u32,
    pub min_io_size: u32,
    pub leb_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub fanout: u32,
    pub fmt_version: u32,
    pub default_compr: Compression,
    pub uuid: [u8; 16],
}

impl SuperblockNode {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < SB_NODE_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: SB_NODE_SZ,
                got: body.len(),
            });
        }
        Ok(Self {
            key_hash: body[2],
            key_fmt: body[3],
            flags: le_u32(body, 4),
            min_io_size: le_u32(body, 8),
            leb_size: le_u32(body, 12),
            leb_cnt: le_u32(body, 16),
            max_leb_cnt: le_u32(body, 20),
            fanout: le_u32(body, 48),
            fmt_version: le_u32(body, 56),
            default_compr: Compression::from_raw(body[60] as u8).unwrap_or(Compression::None),
            uuid: body[84..100].try_into().unwrap(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MasterNode {
    pub highest_inum: u64,
    pub cmt_no: u64,
    pub flags: u32,
    pub root_lnum: u32,
    pub root_offs: u32,
    pub root_len: u32,
}

impl MasterNode {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < MST_NODE_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: MST_NODE_SZ,
                got: body.len(),
            });
        }
        Ok(Self {
            highest_inum: le_u64(body, 0),
            cmt_no: le_u64(body, 8),
            flags: le_u32(body, 16),
            root_lnum: le_u32(body, 24),
            root_offs: le_u32(body, 28),
            root_len: le_u32(body, 32),
        })
    }
}

/// A padding node's body is a single `pad_len` field: the number of
/// further reserved bytes that follow this node's declared length and
/// must also be skipped to reach the next node in the LEB.
#[derive(Debug, Clone, Copy)]
pub struct PadNode {
    pub pad_len: u32,
}

pub const PAD_NODE_SZ: usize = 4;

impl PadNode {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < PAD_NODE_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: PAD_NODE_SZ,
                got: body.len(),
            });
        }
        Ok(Self {
            pad_len: le_u32(body, 0),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub key: Key,
}

#[derive(Debug, Clone)]
pub struct IndexNode {
    pub child_cnt: u16,
    pub level: u16,
    pub branches: Vec<Branch>,
}

impl IndexNode {
    /// `body` is everything after the common header, exactly `len - 24`
    /// bytes. Branch width is derived from `child_cnt` rather than
    /// assumed fixed, per section 4.8: authenticated images append a
    /// per-branch hash after the key, widening each branch beyond
    /// [`BRANCH_SZ`]. Only the leading `lnum/offs/len/key` quadruplet
    /// of each branch is decoded; any trailing hash bytes are skipped.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < IDX_NODE_FIXED_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: IDX_NODE_FIXED_SZ,
                got: body.len(),
            });
        }
        let child_cnt = le_u16(body, 0);
        let level = le_u16(body, 2);
        let rest = &body[IDX_NODE_FIXED_SZ..];
        let mut branches = Vec::with_capacity(child_cnt as usize);
        if child_cnt > 0 {
            let stride = rest.len() / child_cnt as usize;
            if stride < BRANCH_SZ {
                return Err(Error::Parse {
                    what: "UBIFS index node",
                    reason: format!(
                        "branch stride {stride} shorter than minimum {BRANCH_SZ} for {child_cnt} children"
                    ),
                });
            }
            for i in 0..child_cnt as usize {
                let off = i * stride;
                if off + BRANCH_SZ > rest.len() {
                    break;
                }
                let b = &rest[off..off + stride];
                branches.push(Branch {
                    lnum: le_u32(b, 0),
                    offs: le_u32(b, 4),
                    len: le_u32(b, 8),
                    key: Key::parse(&b[12..20]),
                });
            }
        }
        Ok(Self {
            child_cnt,
            level,
            branches,
        })
    }
}

#[derive(Debug, Clone)]
pub struct InodeNode {
    pub key: Key,
    pub size: u64,
    pub atime_sec: u64,
    pub ctime_sec: u64,
    pub mtime_sec: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub data_len: u32,
    pub compr_type: Compression,
    /// Inline payload (symlink target, or the whole file for tiny
    /// files the UBIFS packs directly into the inode). Length is
    /// `data_len`.
    pub inline_data: Vec<u8>,
}

impl InodeNode {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < INO_NODE_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: INO_NODE_SZ,
                got: body.len(),
            });
        }
        let key = Key::parse(&body[0..8]);
        let size = le_u64(body, 24);
        let atime_sec = le_u64(body, 32);
        let ctime_sec = le_u64(body, 40);
        let mtime_sec = le_u64(body, 48);
        let nlink = le_u32(body, 68);
        let uid = le_u32(body, 72);
        let gid = le_u32(body, 76);
        let mode = le_u32(body, 80);
        let data_len = le_u32(body, 88);
        let compr_type = Compression::from_raw((le_u16(body, 108) & 0xFF) as u8)?;
        let data_start = INO_NODE_SZ;
        let data_end = (data_start + data_len as usize).min(body.len());
        let inline_data = body.get(data_start..data_end).unwrap_or(&[]).to_vec();
        Ok(Self {
            key,
            size,
            atime_sec,
            ctime_sec,
            mtime_sec,
            nlink,
            uid,
            gid,
            mode,
            data_len,
            compr_type,
            inline_data,
        })
    }
}

/// Dent and xent nodes share this layout; the common header's
/// `node_type` distinguishes a directory entry from an xattr entry.
#[derive(Debug, Clone)]
pub struct DentNode {
    pub key: Key,
    pub inum: u32,
    pub itype: u8,
    pub name: Vec<u8>,
}

impl DentNode {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < DENT_NODE_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: DENT_NODE_SZ,
                got: body.len(),
            });
        }
        let key = Key::parse(&body[0..8]);
        let inum = le_u32(body, ON_FLASH_KEY_SZ);
        let itype = body[ON_FLASH_KEY_SZ + 9];
        let nlen = le_u16(body, ON_FLASH_KEY_SZ + 10) as usize;
        let name_start = DENT_NODE_SZ;
        let name_end = (name_start + nlen).min(body.len());
        let name = body.get(name_start..name_end).unwrap_or(&[]).to_vec();
        Ok(Self {
            key,
            inum,
            itype,
            name,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DataNode {
    pub key: Key,
    /// Declared uncompressed size of this block (4096, except possibly
    /// the file's last block).
    pub size: u32,
    pub compr_type: Compression,
    /// Absolute file offset of the compressed payload, for lazy
    /// re-reading during reassembly.
    pub payload_offset: u64,
    pub compr_len: u32,
}

impl DataNode {
    /// `body` is the node body (post common-header) with the
    /// compressed payload still attached; `body_file_offset` is where
    /// `body` starts within the underlying volume stream.
    pub fn parse(body: &[u8], body_file_offset: u64, node_len: u32) -> Result<Self> {
        if body.len() < DATA_NODE_SZ {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: DATA_NODE_SZ,
                got: body.len(),
            });
        }
        let key = Key::parse(&body[0..8]);
        let size = le_u32(body, ON_FLASH_KEY_SZ);
        let compr_type = Compression::from_raw(body[ON_FLASH_KEY_SZ + 4])?;
        let compr_len = node_len.saturating_sub((COMMON_HDR_SZ + DATA_NODE_SZ) as u32);
        Ok(Self {
            key,
            size,
            compr_type,
            payload_offset: body_file_offset + DATA_NODE_SZ as u64,
            compr_len,
        })
    }
}

fn le_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn build_common_header(node_type: u8, sqnum: u64, total_len: u32) -> Vec<u8> {
        let mut buf = vec![0u8; COMMON_HDR_SZ];
        buf[0..4].copy_from_slice(&UBIFS_NODE_MAGIC);
        buf[8..16].copy_from_slice(&sqnum.to_le_bytes());
        buf[16..20].copy_from_slice(&total_len.to_le_bytes());
        buf[20] = node_type;
        buf
    }

    /// Builds a complete node (header + body) with a correct CRC.
    pub fn finish_node(mut header: Vec<u8>, body: &[u8]) -> Vec<u8> {
        header.extend_from_slice(body);
        let len = header.len() as u32;
        header[16..20].copy_from_slice(&len.to_le_bytes());
        let crc = crc::flash_crc32(&header[8..]);
        header[4..8].copy_from_slice(&crc.to_le_bytes());
        header
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn key_round_trips() {
        let k = Key {
            inum: 64,
            ktype: KEY_TYPE_DATA,
            hash: 3,
        };
        let buf = k.encode();
        let parsed = Key::parse(&buf[0..8]);
        assert_eq!(parsed, k);
    }

    #[test]
    fn common_header_crc_validates_over_node() {
        let header = build_common_header(6, 1, 0);
        let node = finish_node(header, &[0xAAu8; 16]);
        let hdr = CommonHeader::parse(&node).unwrap();
        assert!(hdr.crc_ok(&node));
    }

    #[test]
    fn common_header_detects_corruption() {
        let header = build_common_header(6, 1, 0);
        let mut node = finish_node(header, &[0xAAu8; 16]);
        let last = node.len() - 1;
        node[last] ^= 0xFF;
        let hdr = CommonHeader::parse(&node).unwrap();
        assert!(!hdr.crc_ok(&node));
    }

    #[test]
    fn index_node_auto_sizes_branches() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        for i in 0..2u32 {
            body.extend_from_slice(&i.to_le_bytes()); // lnum
            body.extend_from_slice(&0u32.to_le_bytes()); // offs
            body.extend_from_slice(&100u32.to_le_bytes()); // len
            let key = Key {
                inum: i + 1,
                ktype: KEY_TYPE_INO,
                hash: 0,
            };
            body.extend_from_slice(&key.encode()[0..8]);
            body.extend_from_slice(&[0u8; 8]); // extra authenticated hash bytes
        }
        let idx = IndexNode::parse(&body).unwrap();
        assert_eq!(idx.child_cnt, 2);
        assert_eq!(idx.branches.len(), 2);
        assert_eq!(idx.branches[1].lnum, 1);
        assert_eq!(idx.branches[1].key.inum, 2);
    }

    #[test]
    fn dent_node_reads_trailing_name() {
        let mut body = vec![0u8; DENT_NODE_SZ];
        let key = Key {
            inum: 1,
            ktype: KEY_TYPE_DENT,
            hash: 42,
        };
        body[0..8].copy_from_slice(&key.encode()[0..8]);
        body[16..20].copy_from_slice(&64u32.to_le_bytes());
        body[25] = 1; // UBIFS_ITYPE_DIR
        body[26..28].copy_from_slice(&5u16.to_le_bytes());
        body.extend_from_slice(b"hello");
        let dent = DentNode::parse(&body).unwrap();
        assert_eq!(dent.inum, 64);
        assert_eq!(dent.itype, 1);
        assert_eq!(dent.name, b"hello");
    }
}
