// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only introspection over already-parsed structures, printed by
//! the `info` subcommand. Mirrors `ubireader/ubi/display.py` and
//! `ubireader/ubifs/display.py`: a tabbed, human-readable dump of the
//! volume table and superblock/master fields, not a new parser.

use crate::ubi::{Image, Volume};
use crate::ubifs::node::SuperblockNode;
use std::fmt;

/// Summarizes one reconstructed UBI image: its sequence number and the
/// volumes found within it.
pub struct ImageSummary<'a>(pub &'a Image);

impl fmt::Display for ImageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UBI image, sequence {}", self.0.image_seq)?;
        writeln!(f, "---------------------")?;
        for volume in &self.0.volumes {
            write!(f, "{}", VolumeSummary(volume))?;
        }
        Ok(())
    }
}

/// Summarizes one volume: its identity and how many of its LEBs
/// actually resolved to a PEB versus were left as fabricated fill.
pub struct VolumeSummary<'a>(pub &'a Volume);

impl fmt::Display for VolumeSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present = self.0.leb_pebs.iter().filter(|p| p.is_some()).count();
        writeln!(f, "  volume {} \"{}\" ({:?})", self.0.vol_id, self.0.name, self.0.vol_type)?;
        writeln!(f, "    alignment: {}", self.0.alignment)?;
        writeln!(f, "    data_pad: {}", self.0.data_pad)?;
        writeln!(f, "    LEBs: {present}/{} present", self.0.leb_count)?;
        Ok(())
    }
}

/// Summarizes a UBIFS superblock's geometry fields, independent of
/// having walked the index yet.
pub struct SuperblockSummary<'a>(pub &'a SuperblockNode);

impl fmt::Display for SuperblockSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UBIFS superblock")?;
        writeln!(f, "---------------------")?;
        writeln!(f, "  min_io_size: {}", self.0.min_io_size)?;
        writeln!(f, "  leb_size: {}", self.0.leb_size)?;
        writeln!(f, "  leb_cnt: {}", self.0.leb_cnt)?;
        writeln!(f, "  max_leb_cnt: {}", self.0.max_leb_cnt)?;
        writeln!(f, "  fanout: {}", self.0.fanout)?;
        writeln!(f, "  fmt_version: {}", self.0.fmt_version)?;
        writeln!(f, "  default_compr: {:?}", self.0.default_compr)?;
        writeln!(f, "  uuid: {:02x?}", self.0.uuid)?;
        Ok(())
    }
}

/// Summarizes the master node slot picked as freshest: its root
/// pointer and the commit number that made it win.
pub struct MasterSummary {
    pub root_lnum: u32,
    pub root_offs: u32,
    pub cmt_no: u64,
}

impl fmt::Display for MasterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UBIFS master node")?;
        writeln!(f, "---------------------")?;
        writeln!(f, "  root: LEB {} offset {}", self.root_lnum, self.root_offs)?;
        writeln!(f, "  cmt_no: {}", self.cmt_no)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ubi::headers::VolType;

    #[test]
    fn volume_summary_counts_present_lebs() {
        let volume = Volume {
            vol_id: 0,
            name: "rootfs".into(),
            vol_type: VolType::Dynamic,
            alignment: 1,
            data_pad: 0,
            leb_count: 3,
            leb_pebs: vec![None, None, None],
        };
        let text = format!("{}", VolumeSummary(&volume));
        assert!(text.contains("0/3 present"));
    }

    #[test]
    fn master_summary_renders_root_pointer() {
        let summary = MasterSummary {
            root_lnum: 5,
            root_offs: 128,
            cmt_no: 42,
        };
        let text = format!("{summary}");
        assert!(text.contains("LEB 5 offset 128"));
        assert!(text.contains("cmt_no: 42"));
    }
}
