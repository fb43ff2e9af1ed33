// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C5: groups the flat descriptor list C4 produced into images (by
//! `image_seq`) and, within each image, into named volumes (by the
//! freshest layout volume's table), resolving wear-leveling
//! duplicates along the way.

use crate::config::Options;
use crate::error::Result;
use crate::ubi::block::{PebDescriptor, PebKind};
use crate::ubi::headers::VolType;
use std::collections::BTreeMap;

/// A reconstructed UBI volume: an ordered list of PEB numbers indexed
/// by `leb_num`, with `None` standing in for a LEB nobody ever wrote
/// (the stream layer fabricates a 0xFF fill for those).
#[derive(Debug, Clone)]
pub struct Volume {
    pub vol_id: u32,
    pub name: String,
    pub vol_type: VolType,
    pub alignment: u32,
    pub data_pad: u32,
    pub leb_count: u32,
    /// One entry per `leb_num`, holding the descriptor of the PEB
    /// selected as freshest for that slot, or `None` if no PEB ever
    /// claimed it.
    pub leb_pebs: Vec<Option<PebDescriptor>>,
}

/// A coherent set of PEBs sharing one `image_seq`.
#[derive(Debug, Clone)]
pub struct Image {
    pub image_seq: u32,
    pub volumes: Vec<Volume>,
}

/// Groups descriptors into images and, per image, into volumes.
///
/// `opts.uboot_fix` folds any descriptor whose `image_seq == 0` into
/// every other image found (a workaround for firmware that rewrites
/// that field during flashing); if it is the *only* `image_seq` seen,
/// it is left alone as a single image.
pub fn assemble(descs: &[PebDescriptor], opts: &Options) -> Result<Vec<Image>> {
    let mut groups: BTreeMap<u32, Vec<&PebDescriptor>> = BTreeMap::new();
    for d in descs {
        if let Some(seq) = d.image_seq() {
            groups.entry(seq).or_default().push(d);
        }
    }

    if opts.uboot_fix {
        if let Some(zero_group) = groups.remove(&0) {
            let other_keys: Vec<u32> = groups.keys().copied().collect();
            if other_keys.is_empty() {
                groups.insert(0, zero_group);
            } else {
                for k in other_keys {
                    groups.get_mut(&k).unwrap().extend(zero_group.iter().copied());
                }
            }
        }
    }

    let mut images = Vec::new();
    for (image_seq, members) in groups {
        images.push(Image {
            image_seq,
            volumes: assemble_image(&members),
        });
    }
    Ok(images)
}

fn assemble_image(members: &[&PebDescriptor]) -> Vec<Volume> {
    let layout_descs: Vec<&PebDescriptor> = members
        .iter()
        .copied()
        .filter(|d| d.kind == PebKind::Layout)
        .collect();
    if layout_descs.is_empty() {
        return Vec::new();
    }

    let mut by_leb: BTreeMap<u32, Vec<&PebDescriptor>> = BTreeMap::new();
    for d in layout_descs {
        by_leb.entry(d.lnum().unwrap_or(0)).or_default().push(d);
    }
    let resolved_layout: Vec<&PebDescriptor> =
        by_leb.into_values().map(resolve_duplicates).collect();
    let freshest = resolved_layout
        .iter()
        .max_by_key(|d| d.vid_hdr.as_ref().map(|v| v.sqnum).unwrap_or(0))
        .expect("non-empty layout set");

    let mut volumes = Vec::new();
    for rec in &freshest.vtbl {
        let vol_id = rec.rec_index as u32;
        let mut by_leb: BTreeMap<u32, Vec<&PebDescriptor>> = BTreeMap::new();
        for d in members
            .iter()
            .copied()
            .filter(|d| d.vol_id() == Some(vol_id) && d.kind != PebKind::Unknown)
        {
            if let Some(lnum) = d.lnum() {
                by_leb.entry(lnum).or_default().push(d);
            }
        }
        let highest_lnum = by_leb.keys().next_back().map(|&l| l + 1).unwrap_or(0);
        let leb_count = rec.reserved_pebs.max(highest_lnum);
        let mut leb_pebs = vec![None; leb_count as usize];
        for (lnum, cands) in by_leb {
            if (lnum as usize) < leb_pebs.len() {
                leb_pebs[lnum as usize] = Some(resolve_duplicates(cands).clone());
            }
        }
        volumes.push(Volume {
            vol_id,
            name: rec.name.clone(),
            vol_type: rec.vol_type.unwrap_or(VolType::Dynamic),
            alignment: rec.alignment,
            data_pad: rec.data_pad,
            leb_count,
            leb_pebs,
        });
    }
    volumes
}

/// Section 4.5's four-step resolution, applied to every descriptor
/// claiming the same `(image_seq, leb_num)`.
fn resolve_duplicates<'a>(candidates: Vec<&'a PebDescriptor>) -> &'a PebDescriptor {
    debug_assert!(!candidates.is_empty());
    if candidates.len() == 1 {
        return candidates[0];
    }

    // Rule 1: prefer the original over a wear-leveling copy.
    let originals: Vec<&PebDescriptor> = candidates
        .iter()
        .copied()
        .filter(|d| !d.vid_hdr.as_ref().is_some_and(|v| v.copy_flag))
        .collect();
    let pool = if originals.len() == 1 {
        return originals[0];
    } else if !originals.is_empty() {
        originals
    } else {
        candidates
    };

    // Rule 2: prefer the descriptor whose stored data CRC matches the
    // recomputed one. Only meaningful for static volumes (open
    // question (a) in the design notes); dynamic volumes rarely
    // disagree here, in which case this rule is a no-op.
    let crc_ok: Vec<&PebDescriptor> = pool
        .iter()
        .copied()
        .filter(|d| {
            d.vid_hdr
                .as_ref()
                .is_some_and(|v| d.data_crc == Some(v.data_crc))
        })
        .collect();
    let pool = if crc_ok.len() == 1 {
        return crc_ok[0];
    } else if !crc_ok.is_empty() {
        crc_ok
    } else {
        pool
    };

    // Rule 3: prefer the higher VID sequence number.
    let max_sqnum = pool
        .iter()
        .filter_map(|d| d.vid_hdr.as_ref().map(|v| v.sqnum))
        .max()
        .unwrap_or(0);
    let freshest: Vec<&PebDescriptor> = pool
        .into_iter()
        .filter(|d| d.vid_hdr.as_ref().is_some_and(|v| v.sqnum == max_sqnum))
        .collect();
    if freshest.len() == 1 {
        return freshest[0];
    }

    // Rule 4: total deadlock, keep the lower peb_num.
    let winner = freshest
        .into_iter()
        .min_by_key(|d| d.peb_num)
        .expect("non-empty candidate pool");
    log::warn!(
        "duplicate LEB resolution deadlock at peb {}; keeping lower peb_num",
        winner.peb_num
    );
    winner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ubi::headers::test_support::*;
    use crate::ubi::headers::VolType as VT;

    fn desc(peb_num: u32, image_seq: u32, vol_id: u32, lnum: u32, sqnum: u64, copy_flag: bool) -> PebDescriptor {
        let ec = EcHeader::parse(&build_ec_header(0, 64, 128, image_seq)).unwrap();
        let vid = VidHeader::parse(&build_vid_header(vol_id, lnum, sqnum, copy_flag, VT::Dynamic)).unwrap();
        PebDescriptor {
            peb_num,
            file_offset: peb_num as u64 * 1024,
            size: 1024,
            ec_hdr: Some(ec),
            vid_hdr: Some(vid),
            vtbl: Vec::new(),
            data_crc: Some(0),
            kind: PebKind::Data,
        }
    }

    use crate::ubi::headers::{EcHeader, VidHeader};

    fn layout_desc(peb_num: u32, image_seq: u32, lnum: u32, sqnum: u64, vtbl: Vec<crate::ubi::headers::VtblRecord>) -> PebDescriptor {
        let mut d = desc(peb_num, image_seq, headers_internal_start(), lnum, sqnum, false);
        d.kind = PebKind::Layout;
        d.vtbl = vtbl;
        d
    }

    fn headers_internal_start() -> u32 {
        crate::ubi::headers::UBI_INTERNAL_VOL_START
    }

    fn rootfs_vtbl() -> Vec<crate::ubi::headers::VtblRecord> {
        let buf = build_vtbl_record("rootfs", 4, VT::Dynamic);
        vec![crate::ubi::headers::parse_vtbl(&buf).remove(0)]
    }

    #[test]
    fn two_images_split_by_image_seq() {
        let descs = vec![
            layout_desc(0, 0xAAAA, 0, 1, rootfs_vtbl()),
            layout_desc(1, 0xBBBB, 0, 1, rootfs_vtbl()),
            desc(2, 0xAAAA, 0, 0, 5, false),
            desc(3, 0xBBBB, 0, 0, 5, false),
        ];
        let images = assemble(&descs, &Options::default()).unwrap();
        assert_eq!(images.len(), 2);
        assert!(images.iter().any(|i| i.image_seq == 0xAAAA));
        assert!(images.iter().any(|i| i.image_seq == 0xBBBB));
    }

    #[test]
    fn wear_leveled_duplicate_prefers_original() {
        // PEB 40: copy (copy_flag=1, sqnum=100); PEB 200: original (copy_flag=0, sqnum=99).
        let copy = desc(40, 1, 0, 7, 100, true);
        let original = desc(200, 1, 0, 7, 99, false);
        let winner = resolve_duplicates(vec![&copy, &original]);
        assert_eq!(winner.peb_num, 200);
    }
}
