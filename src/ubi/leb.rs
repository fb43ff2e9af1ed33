// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C6: presents a reconstructed [`Volume`] as a contiguous,
//! LEB-indexed byte stream, translating logical offsets into PEB data
//! region reads and fabricating 0xFF fills for LEBs nobody ever wrote.

use crate::error::Result;
use crate::io::FileByteSource;
use crate::ubi::volume::Volume;

/// Presents `[0, leb_count * leb_size)` of one volume as if contiguous.
pub struct LebStream<'a> {
    src: &'a mut FileByteSource,
    volume: &'a Volume,
    leb_size: u32,
    pos: u64,
    cache: Option<(u32, Vec<u8>)>,
}

impl<'a> LebStream<'a> {
    pub fn new(src: &'a mut FileByteSource, volume: &'a Volume) -> Self {
        let leb_size = leb_payload_size(volume);
        Self {
            src,
            volume,
            leb_size,
            pos: 0,
            cache: None,
        }
    }

    pub fn leb_size(&self) -> u32 {
        self.leb_size
    }

    pub fn leb_count(&self) -> u32 {
        self.volume.leb_count
    }

    pub fn total_len(&self) -> u64 {
        self.volume.leb_count as u64 * self.leb_size as u64
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Reads `buf.len()` bytes starting at the current position,
    /// advancing it. Reads spanning multiple LEBs are served one LEB
    /// at a time through the one-LEB cache.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let leb_index = (self.pos / self.leb_size as u64) as u32;
            let within = (self.pos % self.leb_size as u64) as usize;
            let leb_data = self.leb_bytes(leb_index)?;
            let take = (leb_data.len() - within).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&leb_data[within..within + take]);
            filled += take;
            self.pos += take as u64;
        }
        Ok(())
    }

    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(&mut buf)?;
        Ok(buf)
    }

    /// Reads `buf.len()` bytes starting at absolute file-relative
    /// volume offset `offset`, without disturbing the stream's current
    /// position. Used by the UBIFS layer to re-read a data node's
    /// compressed payload lazily, by its recorded offset, rather than
    /// holding it in memory during the index walk.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let saved = self.pos;
        self.pos = offset;
        let result = self.read(buf);
        self.pos = saved;
        result
    }

    /// Returns the (cached) payload bytes of one LEB, fabricating an
    /// all-0xFF buffer for LEBs with no backing PEB.
    fn leb_bytes(&mut self, leb_index: u32) -> Result<&[u8]> {
        if self.cache.as_ref().map(|(i, _)| *i) != Some(leb_index) {
            let data = self.read_leb_from_source(leb_index)?;
            self.cache = Some((leb_index, data));
        }
        Ok(&self.cache.as_ref().unwrap().1)
    }

    fn read_leb_from_source(&mut self, leb_index: u32) -> Result<Vec<u8>> {
        let Some(desc) = self
            .volume
            .leb_pebs
            .get(leb_index as usize)
            .and_then(|o| o.as_ref())
        else {
            return Ok(vec![0xFFu8; self.leb_size as usize]);
        };
        let ec = desc.ec_hdr.as_ref().expect("data PEB always has EC header");
        let vid = desc.vid_hdr.as_ref().expect("data PEB always has VID header");
        let data_off = ec.data_offset as u64;
        let data_pad = vid.data_pad as u64;
        let avail = (desc.size as u64).saturating_sub(data_off).saturating_sub(data_pad);
        let want = self.leb_size as u64;
        let mut buf = self
            .src
            .read_vec(desc.file_offset + data_off, avail.min(want) as usize)?;
        buf.resize(self.leb_size as usize, 0xFF);
        Ok(buf)
    }
}

/// The per-LEB payload size is the PEB size minus the backing PEB's
/// `data_offset` and the volume's `data_pad`, inferred from whichever
/// LEB has a descriptor at all.
fn leb_payload_size(volume: &Volume) -> u32 {
    for desc in volume.leb_pebs.iter().flatten() {
        if let (Some(ec), Some(vid)) = (&desc.ec_hdr, &desc.vid_hdr) {
            return desc
                .size
                .saturating_sub(ec.data_offset)
                .saturating_sub(vid.data_pad);
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::ubi::block::{PebDescriptor, PebKind};
    use crate::ubi::headers::test_support::*;
    use crate::ubi::headers::{EcHeader, VidHeader, VolType};
    use std::io::Write;

    fn fixture() -> (std::path::PathBuf, Volume) {
        let peb_size = 256usize;
        let mut file_bytes = Vec::new();

        let mut peb0 = build_ec_header(0, 64, 128, 1);
        peb0.resize(peb_size, 0);
        let vid0 = build_vid_header(5, 0, 1, false, VolType::Dynamic);
        peb0[64..64 + vid0.len()].copy_from_slice(&vid0);
        peb0[128..128 + 4].copy_from_slice(b"DATA");
        file_bytes.extend_from_slice(&peb0);

        let mut path = std::env::temp_dir();
        path.push("ubidump-leb-test-fixture");
        std::fs::File::create(&path).unwrap().write_all(&file_bytes).unwrap();

        let ec = EcHeader::parse(&peb0[0..64]).unwrap();
        let vid = VidHeader::parse(&vid0).unwrap();
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
            leb_pebs: vec![Some(desc), None],
        };
        (path, volume)
    }

    #[test]
    fn reads_present_leb_and_fills_missing() {
        let (path, volume) = fixture();
        let mut opts = Options::default();
        opts.block_size = Some(256);
        let mut src = FileByteSource::open(&path, &opts).unwrap();
        let mut stream = LebStream::new(&mut src, &volume);
        assert_eq!(stream.leb_size(), 128);
        let mut buf = [0u8; 4];
        stream.read(&mut buf).unwrap();
        assert_eq!(&buf, b"DATA");

        stream.seek(stream.leb_size() as u64);
        let filler = stream.read_vec(8).unwrap();
        assert_eq!(filler, vec![0xFFu8; 8]);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn read_at_does_not_disturb_position() {
        let (path, volume) = fixture();
        let mut opts = Options::default();
        opts.block_size = Some(256);
        let mut src = FileByteSource::open(&path, &opts).unwrap();
        let mut stream = LebStream::new(&mut src, &volume);
        stream.seek(64);
        let mut scratch = [0u8; 4];
        stream.read_at(0, &mut scratch).unwrap();
        assert_eq!(&scratch, b"DATA");
        assert_eq!(stream.position(), 64);
        std::fs::remove_file(path).ok();
    }
}
