// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CRC-32 as used throughout UBI and UBIFS: IEEE 802.3 polynomial,
//! initial value `0xFFFFFFFF`, inverted output. `crc32fast` computes
//! exactly this variant; we keep a one-line wrapper so call sites read
//! "the flash CRC" rather than an unqualified crate call.

pub fn flash_crc32(buf: &[u8]) -> u32 {
    crc32fast::hash(buf)
}

/// Verifies `buf`'s CRC against `expected`, returning both values so
/// the caller can build a [`crate::Error::Crc`] with context.
pub fn check(buf: &[u8], expected: u32) -> Result<(), u32> {
    let actual = flash_crc32(buf);
    if actual == expected { Ok(()) } else { Err(actual) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // zlib's crc32("") == 0; inversion keeps that fixed point.
        assert_eq!(flash_crc32(b""), 0);
    }

    #[test]
    fn check_detects_mismatch() {
        let buf = b"ubifs";
        let good = flash_crc32(buf);
        assert!(check(buf, good).is_ok());
        assert_eq!(check(buf, good.wrapping_add(1)), Err(good));
    }
}
