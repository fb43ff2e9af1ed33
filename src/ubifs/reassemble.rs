// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C10: turns one inode's accumulated data nodes back into a byte
//! buffer. Blocks are keyed by their position in the file (the key
//! hash field doubles as a block index for data keys), so reassembly
//! is sort-by-key, fill-the-gaps, decompress-each-block, and truncate
//! to the inode's declared size.

use crate::compress;
use crate::error::Result;
use crate::ubi::LebStream;
use crate::ubifs::node::{DataNode, InodeNode};

/// UBIFS packs file data in fixed-size logical blocks; only the last
/// block of a file is typically shorter.
pub const UBIFS_BLOCK_SIZE: usize = 4096;

/// Reassembles a regular file's contents from its data nodes.
///
/// `data_nodes` need not arrive sorted or de-duplicated; the walker
/// may have seen the same logical block written more than once across
/// different commits. Followed section 4.10's rule of keeping the
/// node with the highest sequence number when more than one data node
/// claims the same block.
pub fn reassemble_file(
    stream: &mut LebStream,
    inode: &InodeNode,
    data_nodes: &[(u64, DataNode)],
    #[cfg_attr(not(feature = "crypto"), allow(unused_variables))] key: Option<[u8; 64]>,
) -> Result<Vec<u8>> {
    let mut by_block: std::collections::BTreeMap<u32, &DataNode> = std::collections::BTreeMap::new();
    let mut sqnum_of: std::collections::HashMap<u32, u64> = std::collections::HashMap::new();
    for (sqnum, node) in data_nodes {
        let block = node.key.hash;
        let keep = match sqnum_of.get(&block) {
            Some(&prev) if prev >= *sqnum => false,
            _ => true,
        };
        if keep {
            by_block.insert(block, node);
            sqnum_of.insert(block, *sqnum);
        }
    }

    let mut out = Vec::with_capacity(inode.size as usize);
    let mut next_block: u32 = 0;
    for (&block, node) in &by_block {
        if block > next_block {
            let gap_blocks = (block - next_block) as usize;
            out.extend(std::iter::repeat(0u8).take(gap_blocks * UBIFS_BLOCK_SIZE));
        }
        let mut payload = vec![0u8; node.compr_len as usize];
        match stream.read_at(node.payload_offset, &mut payload) {
            Ok(()) => {
                #[cfg(feature = "crypto")]
                if let Some(k) = key {
                    payload = crate::crypto::decrypt_data_block(&k, block, &payload);
                }
                match compress::decompress(node.compr_type, node.size as usize, &payload) {
                    Ok(bytes) => out.extend_from_slice(&bytes),
                    Err(e) => {
                        log::warn!(
                            "inode {}: data block {block} failed to decompress: {e}",
                            inode.key.inum
                        );
                        out.extend(std::iter::repeat(0u8).take(node.size as usize));
                    }
                }
            }
            Err(e) => {
                log::warn!("inode {}: data block {block} unreadable: {e}", inode.key.inum);
                out.extend(std::iter::repeat(0u8).take(node.size as usize));
            }
        }
        next_block = block + 1;
    }

    let declared = inode.size as usize;
    match out.len().cmp(&declared) {
        std::cmp::Ordering::Less => out.resize(declared, 0),
        std::cmp::Ordering::Greater => out.truncate(declared),
        std::cmp::Ordering::Equal => {}
    }
    Ok(out)
}
