// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The UBI layer: turns a raw flash dump into a set of named, LEB
//! addressable volumes. C4 ([`block`]) scans physical erase blocks, C5
//! ([`volume`]) groups them into images and volumes, and C6 ([`leb`])
//! presents one volume as a contiguous byte stream.

pub mod block;
pub mod headers;
pub mod leb;
pub mod volume;

pub use block::{PebDescriptor, PebKind};
pub use headers::{EcHeader, VidHeader, VolType, VtblRecord};
pub use leb::LebStream;
pub use volume::{Image, Volume};

use crate::config::Options;
use crate::error::Result;
use crate::io::FileByteSource;

/// Scans `src` and reconstructs every UBI image it contains.
pub fn scan(src: &mut FileByteSource, opts: &Options) -> Result<Vec<Image>> {
    let descriptors = block::scan(src, opts)?;
    volume::assemble(&descriptors, opts)
}
