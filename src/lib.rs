// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only parser and extractor for UBI (unsorted flash block image)
//! and UBIFS (the log-structured file system that lives inside a UBI
//! volume).
//!
//! The crate is organized bottom-up: [`io`] gives a bounded,
//! block-aligned byte source; [`crc`] and [`compress`] are small shared
//! utilities; [`ubi`] reconstructs logical volumes out of physical
//! erase blocks; [`ubifs`] parses the file system that lives on top of
//! one such volume and reassembles its files. [`emitter`] is the sink
//! interface the walker drives; [`sink`] is a concrete implementation
//! that writes to the local disk. [`summary`] renders already-parsed
//! structures for the `info` subcommand.

pub mod compress;
pub mod config;
pub mod crc;
#[cfg(feature = "crypto")]
pub mod crypto;
pub mod emitter;
pub mod error;
pub mod io;
pub mod sink;
pub mod summary;
pub mod ubi;
pub mod ubifs;

pub use config::Options;
pub use error::{Error, Result};

use std::path::Path;

/// Drives the full pipeline: open the source, reconstruct UBI volumes,
/// and for each one that looks like UBIFS, walk its tree and hand the
/// reconstructed file system to `emitter`.
///
/// This is the library-level equivalent of the CLI's `extract`
/// subcommand, factored out so other front ends can reuse it without
/// going through `clap`.
pub struct Driver {
    opts: Options,
}

/// Warnings accumulated while extracting one volume, independent of
/// whatever a logger does with the same events.
#[derive(Debug, Default)]
pub struct Warnings(pub Vec<error::Warning>);

impl Warnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(error::Warning {
            peb: None,
            leb: None,
            offset: None,
            message: message.into(),
        });
    }
}

impl Driver {
    pub fn new(opts: Options) -> Self {
        Self { opts }
    }

    /// Opens `path`, reconstructs all volumes, and extracts every
    /// UBIFS volume found into `emitter`. Returns one `Warnings` set
    /// per extracted volume, in volume order.
    pub fn run(&self, path: &Path, emitter: &mut dyn emitter::Emitter) -> Result<Vec<Warnings>> {
        let mut src = io::FileByteSource::open(path, &self.opts)?;
        let images = ubi::scan(&mut src, &self.opts)?;

        let mut out = Vec::new();
        for image in &images {
            for volume in &image.volumes {
                let mut stream = ubi::LebStream::new(&mut src, volume);
                let mut warnings = Warnings::default();
                match ubifs::Instance::open(&mut stream, &self.opts) {
                    Ok(mut fs) => {
                        fs.walk(&mut warnings)?;
                        fs.extract(emitter, &mut warnings)?;
                    }
                    Err(e) => {
                        log::warn!("volume {}: not a UBIFS instance: {e}", volume.name);
                        warnings.push(format!("skipped: {e}"));
                    }
                }
                out.push(warnings);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_construction_does_not_touch_disk() {
        let _d = Driver::new(Options::default());
    }
}
