// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C11: the abstract sink the output iterator drives. The core never
//! touches a real filesystem itself — every directory, file, link, and
//! special node it discovers becomes a call against this trait. [`sink`]
//! holds the one concrete implementation that writes to local disk.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Per-entry metadata the emitter may choose to apply, gated by
/// [`crate::config::Options::permissions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Meta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
}

/// Which of the two device-node inode types a `mknod` call is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block,
    Char,
}

/// Sink interface for reconstructed filesystem entries (section 6,
/// "Output"). Every method receives a path already validated by
/// [`guard_path`] to be rooted under the emitter's own tree.
pub trait Emitter {
    fn make_dir(&mut self, path: &Path, meta: &Meta) -> Result<()>;
    fn make_file(&mut self, path: &Path, data: &[u8], meta: &Meta) -> Result<()>;
    fn link(&mut self, existing: &Path, new: &Path) -> Result<()>;
    fn symlink(&mut self, path: &Path, target: &[u8], meta: &Meta) -> Result<()>;
    fn mknod(&mut self, path: &Path, kind: DeviceKind, rdev: u32, meta: &Meta) -> Result<()>;
    fn mkfifo(&mut self, path: &Path, meta: &Meta) -> Result<()>;
    fn mksock(&mut self, path: &Path, meta: &Meta) -> Result<()>;
    fn set_timestamps(&mut self, path: &Path, atime: u64, mtime: u64) -> Result<()>;
    fn set_perms(&mut self, path: &Path, meta: &Meta) -> Result<()>;
}

/// Joins `parent` and `name`, rejecting any result that would not stay
/// under `root` once normalized — the defense section 4.11 calls for
/// against a crafted dent whose raw name is `..` or contains a path
/// separator. Names are emitted from the on-flash byte string as-is
/// (UBIFS does not require valid UTF-8), so this operates byte-wise
/// before ever touching the OS path type.
pub fn guard_path(root: &Path, parent: &Path, name: &[u8]) -> Result<PathBuf> {
    let name_str = String::from_utf8_lossy(name);
    let candidate = parent.join(name_str.as_ref());

    let mut normalized = PathBuf::new();
    for comp in candidate.strip_prefix(root).unwrap_or(&candidate).components() {
        match comp {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::PathEscape {
                        path: candidate.display().to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathEscape {
                    path: candidate.display().to_string(),
                });
            }
        }
    }
    Ok(root.join(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_name_stays_under_root() {
        let root = Path::new("/out");
        let p = guard_path(root, root, b"a.txt").unwrap();
        assert_eq!(p, Path::new("/out/a.txt"));
    }

    #[test]
    fn traversal_name_is_rejected() {
        let root = Path::new("/out");
        assert!(guard_path(root, root, b"../etc/passwd").is_err());
    }

    #[test]
    fn nested_traversal_within_subdir_is_rejected() {
        let root = Path::new("/out");
        let sub = root.join("a").join("b");
        assert!(guard_path(root, &sub, b"../../../../etc/passwd").is_err());
    }
}
