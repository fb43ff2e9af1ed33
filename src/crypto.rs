// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Encrypted-filename and encrypted-data support for UBIFS volumes
//! created with an fscrypt policy, gated behind the `crypto` feature
//! and only reachable when [`crate::config::Options::master_key`] is
//! set (design notes section, "Filename and data encryption").
//!
//! Every inode under such a policy carries an xattr named
//! [`ENCRYPTION_CONTEXT_XATTR`] whose target inode's inline data ends
//! in a 16-byte nonce. A per-inode key is derived by AES-ECB-encrypting
//! the master key with that nonce; the derived key then decrypts
//! filenames with AES-CBC-CTS (zero IV) and file data with AES-XTS
//! (tweak = little-endian `(block_id, 0)`).

use crate::error::{Error, Result};
use crate::ubifs::node::{DentNode, InodeNode};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use std::collections::BTreeMap;
use xts_mode::{get_tweak_default, Xts128};

/// The fixed xattr name UBIFS uses to hold an inode's fscrypt context
/// (`fs/ubifs/ubifs.h`'s `UBIFS_XATTR_NAME_ENCRYPTION_CONTEXT`).
pub const ENCRYPTION_CONTEXT_XATTR: &[u8] = b"c";

const AES_BLOCK: usize = 16;

/// Finds the 16-byte nonce for an inode by following its encryption
/// context xattr (among its `xent` entries) to the nonce inode's
/// inline data.
pub fn lookup_nonce(xent: &[DentNode], inodes: &BTreeMap<u32, InodeNode>) -> Option<[u8; 16]> {
    let xattr = xent.iter().find(|x| x.name == ENCRYPTION_CONTEXT_XATTR)?;
    let nonce_ino = inodes.get(&xattr.inum)?;
    let data = &nonce_ino.inline_data;
    if data.len() < 16 {
        return None;
    }
    let mut nonce = [0u8; 16];
    nonce.copy_from_slice(&data[data.len() - 16..]);
    Some(nonce)
}

/// AES-ECB-encrypts `master_key` (64 bytes) with `nonce` as the
/// AES-128 key, one 16-byte block at a time — the fscrypt-style key
/// derivation the reference decoder performs with `nonce` standing in
/// for the cipher key and `master_key` standing in for the plaintext.
pub fn derive_key(master_key: &[u8; 64], nonce: &[u8; 16]) -> [u8; 64] {
    let cipher = Aes128::new(GenericArray::from_slice(nonce));
    let mut out = [0u8; 64];
    for (src, dst) in master_key.chunks(AES_BLOCK).zip(out.chunks_mut(AES_BLOCK)) {
        let mut block = GenericArray::clone_from_slice(src);
        cipher.encrypt_block(&mut block);
        dst.copy_from_slice(&block);
    }
    out
}

/// Decrypts a filename encrypted with AES-256-CBC-CTS and a zero IV,
/// using the low 32 bytes of `derived_key`.
///
/// Ciphertext stealing only applies when the input isn't already a
/// whole number of blocks: the last partial block is recovered via a
/// single ECB block decrypt, the final two blocks are swapped, and the
/// (now block-aligned) buffer runs through ordinary CBC.
pub fn decrypt_filename(derived_key: &[u8; 64], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let key = &derived_key[0..32];
    let mut buf = ciphertext.to_vec();

    if buf.len() > AES_BLOCK {
        let rem = buf.len() % AES_BLOCK;
        if rem != 0 {
            let pad = AES_BLOCK - rem;
            let ecb = Aes256::new(GenericArray::from_slice(key));
            let start = buf.len() - 2 * AES_BLOCK + pad;
            let end = buf.len() - AES_BLOCK + pad;
            let mut second_to_last = GenericArray::clone_from_slice(&buf[start..end]);
            ecb.decrypt_block(&mut second_to_last);
            let tail = second_to_last[AES_BLOCK - pad..].to_vec();
            buf.extend_from_slice(&tail);
        }
        let len = buf.len();
        let (penultimate_start, last_start) = (len - 2 * AES_BLOCK, len - AES_BLOCK);
        let last_block = buf[last_start..].to_vec();
        let penultimate_block = buf[penultimate_start..last_start].to_vec();
        buf[penultimate_start..penultimate_start + AES_BLOCK].copy_from_slice(&last_block);
        buf[penultimate_start + AES_BLOCK..].copy_from_slice(&penultimate_block);
    }

    let iv = [0u8; AES_BLOCK];
    let mut dec = cbc::Decryptor::<Aes256>::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
    let plain = dec
        .decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf)
        .map_err(|e| Error::Decode {
            codec: "aes-cbc-cts",
            reason: e.to_string(),
        })?;
    let mut out = plain.to_vec();
    while out.last() == Some(&0) {
        out.pop();
    }
    Ok(out)
}

/// Strips the 2-byte target-length header and trailing NUL the
/// on-flash encrypted symlink payload carries, then runs
/// [`decrypt_filename`] on what remains — UBIFS encrypts a symlink
/// target the same way it encrypts a directory entry name.
pub fn decrypt_symlink_target(derived_key: &[u8; 64], inline_data: &[u8]) -> Result<Vec<u8>> {
    if inline_data.len() < 3 {
        return Err(Error::Decode {
            codec: "aes-cbc-cts",
            reason: "symlink inline data too short for an encrypted target".into(),
        });
    }
    decrypt_filename(derived_key, &inline_data[2..inline_data.len() - 1])
}

/// Decrypts one data node's plaintext with AES-256-XTS, tweaked by the
/// block's position in the file (`block_id`, the data key's 29-bit
/// block index zero-extended to 128 bits) — the same tweak the
/// reference decoder builds with `struct.pack("<QQ", block_id, 0)`.
pub fn decrypt_data_block(derived_key: &[u8; 64], block_id: u32, data: &[u8]) -> Vec<u8> {
    let cipher_1 = Aes256::new(GenericArray::from_slice(&derived_key[0..32]));
    let cipher_2 = Aes256::new(GenericArray::from_slice(&derived_key[32..64]));
    let xts = Xts128::<Aes256>::new(cipher_1, cipher_2);

    let mut buf = data.to_vec();
    let sector_size = buf.len().max(1);
    xts.decrypt_area(&mut buf, sector_size, block_id as u128, get_tweak_default);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic_and_differs_from_input() {
        let master = [0x11u8; 64];
        let nonce = [0x22u8; 16];
        let a = derive_key(&master, &nonce);
        let b = derive_key(&master, &nonce);
        assert_eq!(a, b);
        assert_ne!(a, master);
    }

    #[test]
    fn single_block_filename_round_trips_through_cbc_only() {
        // Exactly one block: no CTS step needed, pure CBC-with-zero-IV.
        let master = [0x33u8; 64];
        let nonce = [0x44u8; 16];
        let key = derive_key(&master, &nonce);

        let plain = *b"shortname-16byt.";
        let cipher = Aes256::new(GenericArray::from_slice(&key[0..32]));
        let mut block = GenericArray::clone_from_slice(&plain);
        cipher.encrypt_block(&mut block);

        let out = decrypt_filename(&key, &block).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn lookup_nonce_finds_context_xattr() {
        use crate::ubifs::node::{Key, KEY_TYPE_XENT};

        let xent = vec![DentNode {
            key: Key { inum: 1, ktype: KEY_TYPE_XENT, hash: 0 },
            inum: 99,
            itype: 0,
            name: ENCRYPTION_CONTEXT_XATTR.to_vec(),
        }];
        let mut inodes = BTreeMap::new();
        let mut nonce_data = vec![0u8; 8];
        nonce_data.extend_from_slice(&[7u8; 16]);
        inodes.insert(
            99,
            InodeNode {
                key: Key { inum: 99, ktype: crate::ubifs::node::KEY_TYPE_INO, hash: 0 },
                size: 0,
                atime_sec: 0,
                ctime_sec: 0,
                mtime_sec: 0,
                nlink: 1,
                uid: 0,
                gid: 0,
                mode: 0,
                data_len: nonce_data.len() as u32,
                compr_type: crate::compress::Compression::None,
                inline_data: nonce_data,
            },
        );
        let nonce = lookup_nonce(&xent, &inodes).unwrap();
        assert_eq!(nonce, [7u8; 16]);
    }
}
