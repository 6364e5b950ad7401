//! Virtual file system.
//!
//! A single in-memory inode tree rooted at `/`. Inodes live in a slab
//! indexed by inode number; directory children map names to inode numbers,
//! so every reference in the tree is an integer. The system-wide open-file
//! table hands out monotonic IDs which per-process descriptor tables map
//! small fds onto.

pub mod devices;
pub mod inode;
pub mod vfs;

use alloc::{string::String, vec::Vec};

use bitflags::bitflags;

pub use devices::DeviceKind;
pub use inode::{Inode, InodeKind, ROOT_INODE};
pub use vfs::Vfs;

use crate::error::{KernelError, KernelResult};

/// Maximum path length accepted by the resolver.
pub const PATH_MAX: usize = 4096;

/// Maximum length of one path segment.
pub const NAME_MAX: usize = 255;

/// Unix-style permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(u16);

impl Permissions {
    /// rw-r--r--
    pub const fn default_file() -> Self {
        Self(0o644)
    }

    /// rwxr-xr-x
    pub const fn default_dir() -> Self {
        Self(0o755)
    }

    /// r--r--r--
    pub const fn read_only() -> Self {
        Self(0o444)
    }

    pub const fn from_mode(mode: u32) -> Self {
        Self((mode & 0o7777) as u16)
    }

    pub const fn mode(&self) -> u16 {
        self.0
    }

    pub const fn owner_can_write(&self) -> bool {
        self.0 & 0o200 != 0
    }

    pub const fn owner_can_read(&self) -> bool {
        self.0 & 0o400 != 0
    }
}

bitflags! {
    /// Open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const CREATE   = 1 << 2;
        const TRUNCATE = 1 << 3;
        const APPEND   = 1 << 4;
    }
}

impl OpenFlags {
    pub fn read_only() -> Self {
        OpenFlags::READ
    }

    pub fn read_write() -> Self {
        OpenFlags::READ | OpenFlags::WRITE
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(usize),
    Current(isize),
    End(isize),
}

/// Directory-listing entry snapshot.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub kind: InodeKind,
    pub size: usize,
    pub inode: u64,
    pub permissions: Permissions,
}

/// Split a normalized path into segments, rejecting malformed input.
/// Leading and trailing slashes are ignored; `/` yields no segments.
pub(crate) fn path_segments(path: &str) -> KernelResult<Vec<&str>> {
    if path.is_empty() || path.len() > PATH_MAX {
        return Err(KernelError::Invalid { what: "path" });
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in &segments {
        if segment.len() > NAME_MAX || *segment == "." || *segment == ".." {
            return Err(KernelError::Invalid { what: "path segment" });
        }
    }
    Ok(segments)
}

/// Split a path into (parent path, final segment).
pub(crate) fn split_parent(path: &str) -> KernelResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(KernelError::Invalid {
            what: "path has no final segment",
        });
    }
    match trimmed.rfind('/') {
        Some(0) => Ok(("/", &trimmed[1..])),
        Some(pos) => Ok((&trimmed[..pos], &trimmed[pos + 1..])),
        None => Ok(("/", trimmed)),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn segments_normalize_slashes() {
        assert_eq!(path_segments("/usr/bin/").unwrap(), ["usr", "bin"]);
        assert_eq!(path_segments("usr//bin").unwrap(), ["usr", "bin"]);
        assert!(path_segments("/").unwrap().is_empty());
        assert!(path_segments("").is_err());
        assert!(path_segments("/a/../b").is_err());
    }

    #[test]
    fn parent_splitting() {
        assert_eq!(split_parent("/tmp/a.txt").unwrap(), ("/tmp", "a.txt"));
        assert_eq!(split_parent("/tmp").unwrap(), ("/", "tmp"));
        assert_eq!(split_parent("tmp").unwrap(), ("/", "tmp"));
        assert_eq!(split_parent("/usr/bin/").unwrap(), ("/usr", "bin"));
        assert!(split_parent("/").is_err());
    }

    #[test]
    fn permission_bits() {
        let perms = Permissions::from_mode(0o644);
        assert!(perms.owner_can_read());
        assert!(perms.owner_can_write());
        assert!(!Permissions::read_only().owner_can_write());
        assert_eq!(Permissions::default_dir().mode(), 0o755);
    }
}
