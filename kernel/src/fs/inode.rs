//! Inodes.
//!
//! An inode carries identity, type, permissions, timestamps, and one body:
//! a byte buffer for regular files, a name -> inode-number map for
//! directories, or a device key for device files. The body sits behind a
//! per-inode reader/writer lock; the reference count tracks open-file
//! table entries.

use alloc::{collections::BTreeMap, string::String, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::RwLock;

use super::{devices::DeviceKind, Permissions};

/// The root directory's inode number. It exists permanently.
pub const ROOT_INODE: u64 = 1;

/// First inode number handed out after the root.
pub const FIRST_DYNAMIC_INODE: u64 = 2;

/// Inode type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Regular,
    Directory,
    Symlink,
    Device,
    Pipe,
    Socket,
}

/// Mutable inode state, guarded by the per-inode lock.
pub struct InodeBody {
    /// File contents (regular files).
    pub data: Vec<u8>,
    /// Children by name (directories).
    pub children: BTreeMap<String, u64>,
    /// Device key (device files).
    pub device: Option<DeviceKind>,
    pub permissions: Permissions,
    pub uid: u32,
    pub gid: u32,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
}

/// One inode. Every non-root inode has exactly one parent directory.
pub struct Inode {
    pub ino: u64,
    pub kind: InodeKind,
    /// Parent inode number (the root is its own parent).
    pub parent: u64,
    /// Open-file table entries referencing this inode.
    refcount: AtomicUsize,
    pub body: RwLock<InodeBody>,
}

impl Inode {
    fn new(ino: u64, parent: u64, kind: InodeKind, permissions: Permissions) -> Self {
        let now = crate::timer::timestamp_secs();
        Self {
            ino,
            kind,
            parent,
            refcount: AtomicUsize::new(0),
            body: RwLock::new(InodeBody {
                data: Vec::new(),
                children: BTreeMap::new(),
                device: None,
                permissions,
                uid: 0,
                gid: 0,
                created: now,
                modified: now,
                accessed: now,
            }),
        }
    }

    pub fn new_regular(ino: u64, parent: u64, permissions: Permissions) -> Self {
        Self::new(ino, parent, InodeKind::Regular, permissions)
    }

    pub fn new_directory(ino: u64, parent: u64, permissions: Permissions) -> Self {
        Self::new(ino, parent, InodeKind::Directory, permissions)
    }

    pub fn new_device(ino: u64, parent: u64, device: DeviceKind) -> Self {
        let inode = Self::new(ino, parent, InodeKind::Device, Permissions::default_file());
        inode.body.write().device = Some(device);
        inode
    }

    /// Current open-file reference count.
    pub fn ref_count(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn inc_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_ref(&self) -> usize {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "inode refcount underflow");
        prev - 1
    }

    /// File size (regular files), zero otherwise.
    pub fn size(&self) -> usize {
        match self.kind {
            InodeKind::Regular => self.body.read().data.len(),
            _ => 0,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn refcount_tracks_open_references() {
        let inode = Inode::new_regular(2, ROOT_INODE, Permissions::default_file());
        assert_eq!(inode.ref_count(), 0);
        inode.inc_ref();
        inode.inc_ref();
        assert_eq!(inode.ref_count(), 2);
        assert_eq!(inode.dec_ref(), 1);
        assert_eq!(inode.dec_ref(), 0);
    }

    #[test]
    fn device_inode_carries_its_key() {
        let inode = Inode::new_device(5, ROOT_INODE, DeviceKind::Zero);
        assert_eq!(inode.kind, InodeKind::Device);
        assert_eq!(inode.body.read().device, Some(DeviceKind::Zero));
    }

    #[test]
    fn size_is_data_length_for_regular_files() {
        let inode = Inode::new_regular(2, ROOT_INODE, Permissions::default_file());
        assert_eq!(inode.size(), 0);
        inode.body.write().data.extend_from_slice(b"hello");
        assert_eq!(inode.size(), 5);

        let dir = Inode::new_directory(3, ROOT_INODE, Permissions::default_dir());
        assert_eq!(dir.size(), 0);
    }
}
