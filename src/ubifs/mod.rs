// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The UBIFS layer: C7 reads the superblock and freshest master node,
//! C9 walks the committed B+-tree index those two point at, and
//! C10/C11 turn the accumulated inode/dent/data nodes into calls
//! against an [`Emitter`]. [`Instance`] carries a volume through these
//! three stages in order — `open`, then `walk`, then `extract` — since
//! each depends on state the previous stage built.

pub mod node;
pub mod reassemble;

use crate::config::Options;
use crate::emitter::{guard_path, DeviceKind, Emitter, Meta};
use crate::error::{Error, Result};
use crate::ubi::LebStream;
use crate::Warnings;
use node::{CommonHeader, DataNode, DentNode, IndexNode, InodeNode, MasterNode, NodeType, SuperblockNode};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

const ITYPE_REG: u8 = 0;
const ITYPE_DIR: u8 = 1;
const ITYPE_LNK: u8 = 2;
const ITYPE_BLK: u8 = 3;
const ITYPE_CHR: u8 = 4;
const ITYPE_FIFO: u8 = 5;
const ITYPE_SOCK: u8 = 6;

/// Every node the walker has seen that mentions a given inode number:
/// the inode node itself, its data blocks, and its directory/xattr
/// entries (for a directory inode, the entries its children are filed
/// under).
#[derive(Debug, Default)]
struct InodeAccum {
    ino: Option<InodeNode>,
    data: Vec<(u64, DataNode)>,
    dent: Vec<(u64, DentNode)>,
    xent: Vec<(u64, DentNode)>,
}

/// One UBIFS instance living on top of a [`LebStream`], carried through
/// `open -> walk -> extract` in that order.
pub struct Instance<'a, 'b: 'a> {
    stream: &'a mut LebStream<'b>,
    sb: SuperblockNode,
    root_lnum: u32,
    root_offs: u32,
    master_cmt_no: u64,
    warn_only: bool,
    permissions: bool,
    master_key: Option<[u8; 64]>,
    inodes: BTreeMap<u32, InodeAccum>,
}

impl<'a, 'b: 'a> Instance<'a, 'b> {
    /// C7: reads the superblock from LEB 0 and the freshest of the two
    /// master node slots (LEB 1 and 2), per section 4.7. Does not touch
    /// the index; [`Self::walk`] does that.
    pub fn open(stream: &'a mut LebStream<'b>, opts: &Options) -> Result<Self> {
        let (sb_hdr, sb_whole) = read_node_at(stream, 0, 0)?;
        if NodeType::from_raw(sb_hdr.node_type)? != NodeType::Sb {
            return Err(Error::NoSuperblock);
        }
        if !sb_hdr.crc_ok(&sb_whole) && !opts.ignore_block_header_errors {
            return Err(Error::Crc {
                what: "UBIFS superblock node",
                offset: 0,
                expected: sb_hdr.crc,
                actual: crate::crc::flash_crc32(&sb_whole[8..sb_hdr.len as usize]),
            });
        }
        let sb = SuperblockNode::parse(&sb_whole[node::COMMON_HDR_SZ..])?;

        let leb_size = stream.leb_size();
        let mut best: Option<MasterNode> = None;
        for lnum in [1u32, 2u32] {
            for mst in read_masters_in_leb(stream, lnum, leb_size) {
                best = match best {
                    Some(ref cur) if cur.cmt_no >= mst.cmt_no => best,
                    _ => Some(mst),
                };
            }
        }
        let master = best.ok_or(Error::NoMaster)?;

        Ok(Self {
            stream,
            sb,
            root_lnum: master.root_lnum,
            root_offs: master.root_offs,
            master_cmt_no: master.cmt_no,
            warn_only: opts.warn_only_block_read_errors,
            permissions: opts.permissions,
            master_key: opts.master_key,
            inodes: BTreeMap::new(),
        })
    }

    pub fn superblock(&self) -> &SuperblockNode {
        &self.sb
    }

    /// `(root_lnum, root_offs, cmt_no)` of the master node slot picked
    /// as freshest during [`Self::open`], for the `info` subcommand.
    pub fn master_summary(&self) -> (u32, u32, u64) {
        (self.root_lnum, self.root_offs, self.master_cmt_no)
    }

    /// C9: walks the committed index depth-first from the master's
    /// root, accumulating every inode, dent/xent, and data node it
    /// finds. Does not replay the journal (section on non-goals);
    /// everything this sees is already part of the committed tree.
    pub fn walk(&mut self, warnings: &mut Warnings) -> Result<()> {
        let mut stack = vec![(self.root_lnum, self.root_offs)];
        while let Some((lnum, offs)) = stack.pop() {
            let read = read_node_at(self.stream, lnum, offs);
            let (hdr, whole) = match read {
                Ok(v) => v,
                Err(e) => {
                    if self.warn_only {
                        warnings.push(format!("unreadable node at LEB {lnum}:{offs}: {e}"));
                        log::warn!("unreadable node at LEB {lnum}:{offs}: {e}");
                        continue;
                    }
                    return Err(e);
                }
            };
            if !hdr.crc_ok(&whole) {
                let msg = format!("CRC mismatch on node at LEB {lnum}:{offs}");
                if self.warn_only {
                    warnings.push(msg.clone());
                    log::warn!("{msg}");
                    continue;
                }
                return Err(Error::Crc {
                    what: "UBIFS node",
                    offset: offs as u64,
                    expected: hdr.crc,
                    actual: crate::crc::flash_crc32(&whole[8..hdr.len as usize]),
                });
            }

            let node_type = match NodeType::from_raw(hdr.node_type) {
                Ok(t) => t,
                Err(e) => {
                    warnings.push(format!("unknown node type at LEB {lnum}:{offs}: {e}"));
                    continue;
                }
            };
            let body = &whole[node::COMMON_HDR_SZ..];
            let body_file_offset =
                lnum as u64 * self.stream.leb_size() as u64 + offs as u64 + node::COMMON_HDR_SZ as u64;

            match node_type {
                NodeType::Idx => match IndexNode::parse(body) {
                    Ok(idx) => {
                        for b in idx.branches {
                            stack.push((b.lnum, b.offs));
                        }
                    }
                    Err(e) => warnings.push(format!("malformed index node at LEB {lnum}:{offs}: {e}")),
                },
                NodeType::Ino => match InodeNode::parse(body) {
                    Ok(ino) => {
                        self.inodes.entry(ino.key.inum).or_default().ino = Some(ino);
                    }
                    Err(e) => warnings.push(format!("malformed inode node at LEB {lnum}:{offs}: {e}")),
                },
                NodeType::Data => match DataNode::parse(body, body_file_offset, hdr.len) {
                    Ok(data) => {
                        self.inodes
                            .entry(data.key.inum)
                            .or_default()
                            .data
                            .push((hdr.sqnum, data));
                    }
                    Err(e) => warnings.push(format!("malformed data node at LEB {lnum}:{offs}: {e}")),
                },
                NodeType::Dent => match DentNode::parse(body) {
                    Ok(dent) => {
                        self.inodes
                            .entry(dent.key.inum)
                            .or_default()
                            .dent
                            .push((hdr.sqnum, dent));
                    }
                    Err(e) => warnings.push(format!("malformed dent node at LEB {lnum}:{offs}: {e}")),
                },
                NodeType::Xent => match DentNode::parse(body) {
                    Ok(xent) => {
                        self.inodes
                            .entry(xent.key.inum)
                            .or_default()
                            .xent
                            .push((hdr.sqnum, xent));
                    }
                    Err(e) => warnings.push(format!("malformed xent node at LEB {lnum}:{offs}: {e}")),
                },
                NodeType::Pad | NodeType::Trun | NodeType::Ref | NodeType::Cs | NodeType::Orph
                | NodeType::Sb | NodeType::Mst => {}
            }
        }
        Ok(())
    }

    /// C10/C11: depth-first from inode 1 (UBIFS's fixed root inode
    /// number), reassembling regular files and driving `emitter` for
    /// every entry the tree names.
    pub fn extract(&mut self, emitter: &mut dyn Emitter, warnings: &mut Warnings) -> Result<()> {
        let mut hardlinks: HashMap<u32, PathBuf> = HashMap::new();
        let mut ancestors: HashSet<u32> = HashSet::new();
        extract_dir(
            self.stream,
            &self.inodes,
            self.permissions,
            self.master_key,
            1,
            &PathBuf::new(),
            emitter,
            warnings,
            &mut hardlinks,
            &mut ancestors,
        )
    }
}

fn meta_of(ino: &InodeNode, permissions: bool) -> Meta {
    if permissions {
        Meta {
            mode: ino.mode,
            uid: ino.uid,
            gid: ino.gid,
            atime: ino.atime_sec,
            mtime: ino.mtime_sec,
        }
    } else {
        Meta::default()
    }
}

/// Derives this inode's per-file key from its encryption-context
/// xattr's nonce, when a master key is configured and the `crypto`
/// feature is built. Returns `None` for unencrypted volumes, missing
/// keys, or inodes with no matching xattr (section DESIGN NOTES,
/// "Filename and data encryption").
#[cfg(feature = "crypto")]
fn inode_key(
    inodes: &BTreeMap<u32, InodeAccum>,
    accum: &InodeAccum,
    master_key: Option<[u8; 64]>,
) -> Option<[u8; 64]> {
    let master_key = master_key?;
    let xattr = accum
        .xent
        .iter()
        .find(|(_, x)| x.name == crate::crypto::ENCRYPTION_CONTEXT_XATTR)?;
    let nonce_ino = inodes.get(&xattr.1.inum)?.ino.as_ref()?;
    let data = &nonce_ino.inline_data;
    if data.len() < 16 {
        return None;
    }
    let mut nonce = [0u8; 16];
    nonce.copy_from_slice(&data[data.len() - 16..]);
    Some(crate::crypto::derive_key(&master_key, &nonce))
}

#[cfg(not(feature = "crypto"))]
fn inode_key(
    _inodes: &BTreeMap<u32, InodeAccum>,
    _accum: &InodeAccum,
    _master_key: Option<[u8; 64]>,
) -> Option<[u8; 64]> {
    None
}

/// Decrypts `raw_name` with the parent directory's per-inode key, or
/// returns it unchanged when there is no master key, no `crypto`
/// feature, or decryption fails (logged as a warning, not fatal —
/// section DESIGN NOTES says names simply stay opaque without a key).
fn decrypted_name(
    inodes: &BTreeMap<u32, InodeAccum>,
    parent: &InodeAccum,
    raw_name: &[u8],
    master_key: Option<[u8; 64]>,
    #[cfg_attr(not(feature = "crypto"), allow(unused_variables))] warnings: &mut Warnings,
) -> Vec<u8> {
    #[cfg(feature = "crypto")]
    {
        if let Some(key) = inode_key(inodes, parent, master_key) {
            match crate::crypto::decrypt_filename(&key, raw_name) {
                Ok(name) => return name,
                Err(e) => warnings.push(format!("failed to decrypt dent name: {e}")),
            }
        }
    }
    let _ = (inodes, parent, master_key);
    raw_name.to_vec()
}

/// Decrypts a symlink's inline target with its own per-inode key, or
/// returns the plain NUL-truncated target unchanged when there is no
/// key available.
fn decrypted_symlink(
    inodes: &BTreeMap<u32, InodeAccum>,
    accum: &InodeAccum,
    inline_data: &[u8],
    master_key: Option<[u8; 64]>,
    #[cfg_attr(not(feature = "crypto"), allow(unused_variables))] warnings: &mut Warnings,
) -> Vec<u8> {
    #[cfg(feature = "crypto")]
    {
        if let Some(key) = inode_key(inodes, accum, master_key) {
            match crate::crypto::decrypt_symlink_target(&key, inline_data) {
                Ok(target) => return target,
                Err(e) => warnings.push(format!("failed to decrypt symlink target: {e}")),
            }
        }
    }
    let _ = (inodes, accum, master_key);
    strip_nul(inline_data).to_vec()
}

/// Picks the freshest dent per name: section 4.9's committed index
/// should contain exactly one, but a corrupt image can surface more
/// than one leaf under the same key, so the highest sequence number
/// wins rather than the first one seen.
fn freshest_by_name(entries: &[(u64, DentNode)]) -> Vec<&DentNode> {
    let mut by_name: HashMap<&[u8], (u64, &DentNode)> = HashMap::new();
    for (sqnum, dent) in entries {
        by_name
            .entry(dent.name.as_slice())
            .and_modify(|slot| {
                if *sqnum > slot.0 {
                    *slot = (*sqnum, dent);
                }
            })
            .or_insert((*sqnum, dent));
    }
    let mut out: Vec<&DentNode> = by_name.into_values().map(|(_, d)| d).collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

#[allow(clippy::too_many_arguments)]
fn extract_dir(
    stream: &mut LebStream,
    inodes: &BTreeMap<u32, InodeAccum>,
    permissions: bool,
    master_key: Option<[u8; 64]>,
    inum: u32,
    rel: &Path,
    emitter: &mut dyn Emitter,
    warnings: &mut Warnings,
    hardlinks: &mut HashMap<u32, PathBuf>,
    ancestors: &mut HashSet<u32>,
) -> Result<()> {
    if !ancestors.insert(inum) {
        return Err(Error::CyclicLink { inum });
    }

    let Some(accum) = inodes.get(&inum) else {
        return Err(Error::DanglingDent { inum });
    };

    for dent in freshest_by_name(&accum.dent) {
        let name = decrypted_name(inodes, accum, &dent.name, master_key, warnings);
        let child_path = guard_path(Path::new(""), rel, &name)?;
        let child_inum = dent.inum;
        let Some(child_accum) = inodes.get(&child_inum) else {
            warnings.push(format!("dangling dent {:?} -> inode {child_inum}", dent.name));
            continue;
        };
        let Some(child_ino) = &child_accum.ino else {
            warnings.push(format!("dent {:?} names inode {child_inum} with no inode node", dent.name));
            continue;
        };
        let meta = meta_of(child_ino, permissions);

        match dent.itype {
            ITYPE_DIR => {
                emitter.make_dir(&child_path, &meta)?;
                extract_dir(
                    stream, inodes, permissions, master_key, child_inum, &child_path, emitter,
                    warnings, hardlinks, ancestors,
                )?;
            }
            ITYPE_REG => {
                if let Some(existing) = hardlinks.get(&child_inum) {
                    emitter.link(existing, &child_path)?;
                } else {
                    let key = inode_key(inodes, child_accum, master_key);
                    let data =
                        reassemble::reassemble_file(stream, child_ino, &child_accum.data, key)?;
                    emitter.make_file(&child_path, &data, &meta)?;
                    if child_ino.nlink > 1 {
                        hardlinks.insert(child_inum, child_path.clone());
                    }
                }
            }
            ITYPE_LNK => {
                let target =
                    decrypted_symlink(inodes, child_accum, &child_ino.inline_data, master_key, warnings);
                emitter.symlink(&child_path, &target, &meta)?;
            }
            ITYPE_BLK | ITYPE_CHR => {
                let kind = if dent.itype == ITYPE_BLK {
                    DeviceKind::Block
                } else {
                    DeviceKind::Char
                };
                let rdev = child_ino
                    .inline_data
                    .get(0..4)
                    .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                    .unwrap_or(0);
                emitter.mknod(&child_path, kind, rdev, &meta)?;
            }
            ITYPE_FIFO => emitter.mkfifo(&child_path, &meta)?,
            ITYPE_SOCK => emitter.mksock(&child_path, &meta)?,
            other => {
                warnings.push(format!("dent {:?} has unknown file type {other}", dent.name));
            }
        }
    }

    ancestors.remove(&inum);
    Ok(())
}

fn strip_nul(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == 0) {
        Some(i) => &data[..i],
        None => data,
    }
}

/// Walks one master-slot LEB from offset 0, honoring interleaved
/// padding nodes, and collects every master node decoded along the
/// way (section 4.7): commits accumulate master attempts one after
/// another, so the freshest lives somewhere past offset 0, not
/// necessarily at it. Stops at the first common-header CRC mismatch
/// or unrecognized node type, per spec.
fn read_masters_in_leb(stream: &mut LebStream, lnum: u32, leb_size: u32) -> Vec<MasterNode> {
    let mut out = Vec::new();
    let mut offset: u32 = 0;
    while (offset as u64) + node::COMMON_HDR_SZ as u64 <= leb_size as u64 {
        let Ok((hdr, whole)) = read_node_at(stream, lnum, offset) else {
            break;
        };
        if !hdr.crc_ok(&whole) {
            break;
        }
        match NodeType::from_raw(hdr.node_type) {
            Ok(NodeType::Mst) => {
                if let Ok(mst) = MasterNode::parse(&whole[node::COMMON_HDR_SZ..]) {
                    out.push(mst);
                } else {
                    log::warn!("malformed master node in LEB {lnum} at offset {offset}");
                }
                offset = offset.saturating_add(hdr.len);
            }
            Ok(NodeType::Pad) => {
                let pad_len = node::PadNode::parse(&whole[node::COMMON_HDR_SZ..])
                    .map(|p| p.pad_len)
                    .unwrap_or(0);
                offset = offset.saturating_add(hdr.len).saturating_add(pad_len);
            }
            _ => break,
        }
        if hdr.len == 0 {
            break;
        }
    }
    out
}

/// Reads one full node (header and body) starting at `(lnum, offs)`
/// within `stream`, without disturbing its current read position.
fn read_node_at(stream: &mut LebStream, lnum: u32, offs: u32) -> Result<(CommonHeader, Vec<u8>)> {
    let abs = lnum as u64 * stream.leb_size() as u64 + offs as u64;
    let mut hdr_buf = vec![0u8; node::COMMON_HDR_SZ];
    stream.read_at(abs, &mut hdr_buf)?;
    let hdr = CommonHeader::parse(&hdr_buf)?;
    let mut whole = vec![0u8; hdr.len as usize];
    stream.read_at(abs, &mut whole)?;
    Ok((hdr, whole))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ubifs::node::{Key, KEY_TYPE_DENT};

    fn dent(name: &[u8], inum: u32, sqnum: u64) -> (u64, DentNode) {
        (
            sqnum,
            DentNode {
                key: Key {
                    inum: 1,
                    ktype: KEY_TYPE_DENT,
                    hash: 0,
                },
                inum,
                itype: ITYPE_REG,
                name: name.to_vec(),
            },
        )
    }

    #[test]
    fn freshest_by_name_prefers_higher_sqnum() {
        let entries = vec![dent(b"a", 10, 1), dent(b"a", 11, 5), dent(b"b", 20, 3)];
        let picked = freshest_by_name(&entries);
        assert_eq!(picked.len(), 2);
        let a = picked.iter().find(|d| d.name == b"a").unwrap();
        assert_eq!(a.inum, 11);
    }

    #[test]
    fn strip_nul_truncates_at_first_zero() {
        assert_eq!(strip_nul(b"target\0garbage"), b"target");
        assert_eq!(strip_nul(b"no-nul"), b"no-nul");
    }

    #[test]
    fn read_masters_in_leb_picks_highest_commit_number() {
        use crate::config::Options;
        use crate::io::FileByteSource;
        use crate::ubi::block::{PebDescriptor, PebKind};
        use crate::ubi::headers::test_support::*;
        use crate::ubi::headers::{EcHeader, VidHeader, VolType};
        use crate::ubi::volume::Volume;
        use crate::ubifs::node::test_support::{build_common_header, finish_node};
        use crate::ubifs::node::MST_NODE_SZ;
        use std::io::Write;

        const MST_NODE_TYPE: u8 = 7;

        fn master_body(cmt_no: u64) -> Vec<u8> {
            let mut body = vec![0u8; MST_NODE_SZ];
            body[8..16].copy_from_slice(&cmt_no.to_le_bytes());
            body
        }

        // Two master attempts back to back in one LEB, as left behind
        // by two separate commits: the second (higher sqnum/cmt_no)
        // is not at offset 0, so picking offset 0 alone would pick the
        // stale one.
        let first = finish_node(build_common_header(MST_NODE_TYPE, 1, 0), &master_body(5));
        let second = finish_node(build_common_header(MST_NODE_TYPE, 2, 0), &master_body(9));
        let mut leb_payload = first.clone();
        leb_payload.extend_from_slice(&second);

        let data_offset = 128usize;
        let leb_size = 1200usize;
        let peb_size = data_offset + leb_size;
        let mut peb1 = build_ec_header(0, 64, data_offset as u32, 1);
        peb1.resize(peb_size, 0xFF);
        let vid1 = build_vid_header(5, 1, 1, false, VolType::Dynamic);
        peb1[64..64 + vid1.len()].copy_from_slice(&vid1);
        peb1[data_offset..data_offset + leb_payload.len()].copy_from_slice(&leb_payload);

        let mut path = std::env::temp_dir();
        path.push("ubidump-master-leb-test-fixture");
        std::fs::File::create(&path).unwrap().write_all(&peb1).unwrap();

        let ec = EcHeader::parse(&peb1[0..64]).unwrap();
        let vid = VidHeader::parse(&vid1).unwrap();
        let desc = PebDescriptor {
            peb_num: 0,
            file_offset: 0,
            size: peb_size as u32,
            ec_hdr: Some(ec),
            vid_hdr: Some(vid),
            vtbl: Vec::new(),
            data_crc: None,
            kind: PebKind::Data,
        };
        let volume = Volume {
            vol_id: 5,
            name: "rootfs".into(),
            vol_type: VolType::Dynamic,
            alignment: 1,
            data_pad: 0,
            leb_count: 2,
            leb_pebs: vec![None, Some(desc)],
        };

        let mut opts = Options::default();
        opts.block_size = Some(peb_size as u32);
        let mut src = FileByteSource::open(&path, &opts).unwrap();
        let mut stream = LebStream::new(&mut src, &volume);
        let masters = read_masters_in_leb(&mut stream, 1, stream.leb_size());
        assert_eq!(masters.len(), 2);
        let best = masters.iter().max_by_key(|m| m.cmt_no).unwrap();
        assert_eq!(best.cmt_no, 9);
        std::fs::remove_file(path).ok();
    }
}
