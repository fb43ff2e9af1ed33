// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The one concrete [`Emitter`]: writes a reconstructed tree to local
//! disk under a fixed root directory. Dispatch mirrors the reference
//! extractor's `extract_dents`/`_process_reg_file` walk — directory,
//! then regular file (first writer wins, later dents hard-link),
//! symlink, device node, FIFO, socket — just against `std::fs` and
//! `nix` instead of `os.mkdir`/`os.mknod`.

use crate::emitter::{DeviceKind, Emitter, Meta};
use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::{symlink as unix_symlink, PermissionsExt};
use std::path::{Path, PathBuf};

/// Writes every emitted entry under `root`, which must already exist.
pub struct LocalDiskEmitter {
    root: PathBuf,
    apply_perms: bool,
}

impl LocalDiskEmitter {
    pub fn new(root: impl Into<PathBuf>, apply_perms: bool) -> Self {
        Self {
            root: root.into(),
            apply_perms,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn apply_meta(&self, full: &Path, meta: &Meta) -> Result<()> {
        if !self.apply_perms {
            return Ok(());
        }
        fs::set_permissions(full, fs::Permissions::from_mode(meta.mode))?;
        set_times(full, meta.atime, meta.mtime)?;
        Ok(())
    }
}

impl Emitter for LocalDiskEmitter {
    fn make_dir(&mut self, path: &Path, meta: &Meta) -> Result<()> {
        let full = self.resolve(path);
        fs::create_dir_all(&full)?;
        self.apply_meta(&full, meta)
    }

    fn make_file(&mut self, path: &Path, data: &[u8], meta: &Meta) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, data)?;
        self.apply_meta(&full, meta)
    }

    fn link(&mut self, existing: &Path, new: &Path) -> Result<()> {
        let existing_full = self.resolve(existing);
        let new_full = self.resolve(new);
        if let Some(parent) = new_full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::hard_link(&existing_full, &new_full)?;
        Ok(())
    }

    fn symlink(&mut self, path: &Path, target: &[u8], meta: &Meta) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let target_str = String::from_utf8_lossy(target);
        unix_symlink(target_str.as_ref(), &full)?;
        let _ = meta;
        Ok(())
    }

    fn mknod(&mut self, path: &Path, kind: DeviceKind, rdev: u32, meta: &Meta) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mode = (if self.apply_perms { meta.mode } else { 0o600 }) & !0o170000;
        let kind_flag = match kind {
            DeviceKind::Block => nix::sys::stat::SFlag::S_IFBLK,
            DeviceKind::Char => nix::sys::stat::SFlag::S_IFCHR,
        };
        let mode_flag = nix::sys::stat::Mode::from_bits_truncate(mode);
        nix::sys::stat::mknod(&full, kind_flag, mode_flag, rdev as u64)
            .map_err(|e| nix_to_io(e, "mknod"))?;
        self.apply_meta(&full, meta)
    }

    fn mkfifo(&mut self, path: &Path, meta: &Meta) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mode = if self.apply_perms { meta.mode } else { 0o600 };
        let mode_flag = nix::sys::stat::Mode::from_bits_truncate(mode & 0o7777);
        nix::unistd::mkfifo(&full, mode_flag).map_err(|e| nix_to_io(e, "mkfifo"))?;
        self.apply_meta(&full, meta)
    }

    fn mksock(&mut self, path: &Path, meta: &Meta) -> Result<()> {
        // Binding a UNIX socket on disk would require an active
        // listener; the reference extractor settles for an empty
        // placeholder file at the same path and so do we.
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, [])?;
        self.apply_meta(&full, meta)
    }

    fn set_timestamps(&mut self, path: &Path, atime: u64, mtime: u64) -> Result<()> {
        set_times(&self.resolve(path), atime, mtime)
    }

    fn set_perms(&mut self, path: &Path, meta: &Meta) -> Result<()> {
        let full = self.resolve(path);
        fs::set_permissions(&full, fs::Permissions::from_mode(meta.mode))?;
        Ok(())
    }
}

fn set_times(path: &Path, atime: u64, mtime: u64) -> Result<()> {
    let atime = filetime::FileTime::from_unix_time(atime as i64, 0);
    let mtime = filetime::FileTime::from_unix_time(mtime as i64, 0);
    filetime::set_file_times(path, atime, mtime)
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), e.to_string())))
}

fn nix_to_io(e: nix::errno::Errno, what: &'static str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{what}: {e}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Meta;

    fn tmp_root(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("ubidump-sink-test-{name}"));
        fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn make_file_creates_parents_and_content() {
        let root = tmp_root("make-file");
        let mut sink = LocalDiskEmitter::new(&root, false);
        sink.make_file(Path::new("a/b/c.txt"), b"hi", &Meta::default()).unwrap();
        let got = fs::read(root.join("a/b/c.txt")).unwrap();
        assert_eq!(got, b"hi");
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn link_creates_additional_name() {
        let root = tmp_root("link");
        let mut sink = LocalDiskEmitter::new(&root, false);
        sink.make_file(Path::new("first"), b"data", &Meta::default()).unwrap();
        sink.link(Path::new("first"), Path::new("second")).unwrap();
        assert_eq!(fs::read(root.join("second")).unwrap(), b"data");
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn symlink_points_at_raw_target_bytes() {
        let root = tmp_root("symlink");
        let mut sink = LocalDiskEmitter::new(&root, false);
        sink.symlink(Path::new("link"), b"/etc/passwd", &Meta::default()).unwrap();
        let target = fs::read_link(root.join("link")).unwrap();
        assert_eq!(target, Path::new("/etc/passwd"));
        fs::remove_dir_all(&root).ok();
    }
}
