// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatches a UBIFS data node's compressed payload to the codec its
//! `compr_type` field names. Mirrors the teacher's `repl::inflate`
//! (raw `miniz_oxide` inflate), but without the zlib-header-parsing
//! flag: UBIFS deflate streams are headerless, matching the reference
//! reader's `zlib.decompress(data, -11)`.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzo,
    Zlib,
}

impl Compression {
    pub fn from_raw(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Lzo),
            2 => Ok(Self::Zlib),
            other => Err(Error::UnknownCompression(other)),
        }
    }
}

/// Decompresses `data` into exactly `unc_len` bytes. `unc_len` is
/// required for LZO because the stream does not embed the
/// uncompressed length itself; for zlib and the identity codec it is
/// used only to size the output buffer.
pub fn decompress(kind: Compression, unc_len: usize, data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        Compression::None => Ok(data.to_vec()),
        Compression::Lzo => decompress_lzo(unc_len, data),
        Compression::Zlib => decompress_zlib(unc_len, data),
    }
}

fn decompress_lzo(unc_len: usize, data: &[u8]) -> Result<Vec<u8>> {
    // The reference reader goes through CPython's `lzo` module, which
    // expects its own `0xf0` + big-endian-length container in front of
    // the raw stream. `minilzo-rs` binds `lzo1x_decompress_safe`
    // directly and wants only the raw compressed bytes plus the
    // expected output length; prepending that container would feed
    // the tag byte in as a bogus LZO1X opcode.
    minilzo::decompress(data, unc_len).map_err(|e| Error::Decode {
        codec: "lzo",
        reason: format!("{e:?}"),
    })
}

fn decompress_zlib(unc_len: usize, data: &[u8]) -> Result<Vec<u8>> {
    use miniz_oxide::inflate::core::inflate_flags::TINFL_FLAG_USING_NON_WRAPPING_OUTPUT_BUF;
    use miniz_oxide::inflate::core::{decompress, DecompressorOxide};
    use miniz_oxide::inflate::TINFLStatus;

    let mut out = vec![0u8; unc_len];
    let mut r = DecompressorOxide::new();
    let (status, _, written) =
        decompress(&mut r, data, &mut out, 0, TINFL_FLAG_USING_NON_WRAPPING_OUTPUT_BUF);
    match status {
        TINFLStatus::Done | TINFLStatus::HasMoreOutput => {
            out.truncate(written);
            Ok(out)
        }
        other => Err(Error::Decode {
            codec: "zlib",
            reason: format!("{other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passthrough() {
        let data = b"hello world";
        let out = decompress(Compression::None, data.len(), data).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn from_raw_rejects_unknown() {
        assert!(Compression::from_raw(9).is_err());
    }
}
