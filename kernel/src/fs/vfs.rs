//! VFS core: the inode slab, path resolution, and the open-file table.

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use super::{
    devices::{self, DeviceKind},
    inode::{Inode, InodeKind, FIRST_DYNAMIC_INODE, ROOT_INODE},
    path_segments, split_parent, FileInfo, OpenFlags, Permissions, SeekFrom,
};
use crate::error::{KernelError, KernelResult};

/// One entry of the system-wide open-file table.
pub struct OpenFile {
    pub ino: u64,
    pub flags: OpenFlags,
    position: Mutex<usize>,
}

impl OpenFile {
    /// Current file position.
    pub fn position(&self) -> usize {
        *self.position.lock()
    }
}

/// The virtual file system: one in-memory inode tree rooted at `/`.
pub struct Vfs {
    /// Inode slab indexed by inode number. The lock is structural: it
    /// guards the map itself, not inode bodies.
    inodes: RwLock<BTreeMap<u64, Arc<Inode>>>,
    /// Monotonic inode-number allocator (2 upward; 1 is the root).
    next_ino: AtomicU64,
    /// System-wide open-file table, indexed by a monotonic ID.
    open_files: RwLock<BTreeMap<u64, Arc<OpenFile>>>,
    next_open_id: AtomicU64,
}

impl Vfs {
    /// An empty tree containing only the root directory.
    pub fn new() -> Self {
        let mut inodes = BTreeMap::new();
        inodes.insert(
            ROOT_INODE,
            Arc::new(Inode::new_directory(
                ROOT_INODE,
                ROOT_INODE,
                Permissions::default_dir(),
            )),
        );
        Self {
            inodes: RwLock::new(inodes),
            next_ino: AtomicU64::new(FIRST_DYNAMIC_INODE),
            open_files: RwLock::new(BTreeMap::new()),
            next_open_id: AtomicU64::new(1),
        }
    }

    /// Materialize the standard boot skeleton: the FHS directory set plus
    /// the four device nodes.
    pub fn init_skeleton(&self) -> KernelResult<()> {
        for dir in [
            "/bin", "/sbin", "/usr", "/usr/bin", "/usr/sbin", "/etc", "/var", "/tmp", "/dev",
            "/proc", "/sys", "/home",
        ] {
            self.mkdir(dir, Permissions::default_dir())?;
        }
        self.mknod_device("/dev/null", DeviceKind::Null)?;
        self.mknod_device("/dev/zero", DeviceKind::Zero)?;
        self.mknod_device("/dev/console", DeviceKind::Console)?;
        self.mknod_device("/dev/tty", DeviceKind::Tty)?;
        log::info!("vfs: skeleton ready ({} inodes)", self.inode_count());
        Ok(())
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    /// Fetch an inode from the slab.
    pub fn inode(&self, ino: u64) -> KernelResult<Arc<Inode>> {
        self.inodes
            .read()
            .get(&ino)
            .cloned()
            .ok_or(KernelError::NotFound { resource: "inode" })
    }

    /// Walk a path segment by segment from the root. Any missing segment
    /// yields NotFound; a file in directory position is Invalid.
    pub fn resolve(&self, path: &str) -> KernelResult<u64> {
        let segments = path_segments(path)?;
        let mut current = ROOT_INODE;
        for segment in segments {
            let inode = self.inode(current)?;
            if inode.kind != InodeKind::Directory {
                return Err(KernelError::Invalid {
                    what: "path component is not a directory",
                });
            }
            let body = inode.body.read();
            current = *body.children.get(segment).ok_or(KernelError::NotFound {
                resource: "path",
            })?;
        }
        Ok(current)
    }

    // -- open-file table ----------------------------------------------------

    /// Open a path: resolve the inode (creating it for `CREATE`), allocate
    /// an open-file entry, and bump the inode's refcount.
    pub fn open(&self, path: &str, flags: OpenFlags) -> KernelResult<u64> {
        let ino = match self.resolve(path) {
            Ok(ino) => ino,
            Err(KernelError::NotFound { .. }) if flags.contains(OpenFlags::CREATE) => {
                self.create_inode(path, InodeKind::Regular, Permissions::default_file(), None)?
            }
            Err(e) => return Err(e),
        };

        let inode = self.inode(ino)?;
        if inode.kind == InodeKind::Directory && flags.contains(OpenFlags::WRITE) {
            return Err(KernelError::NotPermitted {
                operation: "open a directory for writing",
            });
        }

        if flags.contains(OpenFlags::TRUNCATE) && inode.kind == InodeKind::Regular {
            let mut body = inode.body.write();
            body.data.clear();
            body.modified = crate::timer::timestamp_secs();
        }

        let start = if flags.contains(OpenFlags::APPEND) {
            inode.size()
        } else {
            0
        };

        inode.inc_ref();
        let id = self.next_open_id.fetch_add(1, Ordering::Relaxed);
        self.open_files.write().insert(
            id,
            Arc::new(OpenFile {
                ino,
                flags,
                position: Mutex::new(start),
            }),
        );
        Ok(id)
    }

    /// Close an open file: drop the table entry and the inode reference.
    pub fn close(&self, id: u64) -> KernelResult<()> {
        let entry = self
            .open_files
            .write()
            .remove(&id)
            .ok_or(KernelError::NotFound {
                resource: "open file",
            })?;
        if let Ok(inode) = self.inode(entry.ino) {
            inode.dec_ref();
        }
        Ok(())
    }

    /// The inode number behind an open-file id (used by file-backed mmap).
    pub fn open_file_ino(&self, id: u64) -> KernelResult<u64> {
        self.open_entry(id).map(|e| e.ino)
    }

    fn open_entry(&self, id: u64) -> KernelResult<Arc<OpenFile>> {
        self.open_files
            .read()
            .get(&id)
            .cloned()
            .ok_or(KernelError::NotFound {
                resource: "open file",
            })
    }

    // -- I/O ----------------------------------------------------------------

    /// Read from an open file. Regular files copy from the data buffer at
    /// the file position (0 at EOF); device files delegate to the device
    /// seam.
    pub fn read(&self, id: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let entry = self.open_entry(id)?;
        if !entry.flags.contains(OpenFlags::READ) {
            return Err(KernelError::NotPermitted {
                operation: "read from a write-only descriptor",
            });
        }
        let inode = self.inode(entry.ino)?;

        match inode.kind {
            InodeKind::Regular => {
                let mut pos = entry.position.lock();
                let body = inode.body.read();
                if *pos >= body.data.len() {
                    return Ok(0);
                }
                let n = buf.len().min(body.data.len() - *pos);
                buf[..n].copy_from_slice(&body.data[*pos..*pos + n]);
                *pos += n;
                drop(body);
                inode.body.write().accessed = crate::timer::timestamp_secs();
                Ok(n)
            }
            InodeKind::Device => {
                let device = inode.body.read().device.ok_or(KernelError::DeviceError {
                    device: "missing device key",
                })?;
                Ok(devices::device_read(device, buf))
            }
            _ => Err(KernelError::NotPermitted {
                operation: "read from this inode type",
            }),
        }
    }

    /// Write to an open file. Regular files grow the buffer when the final
    /// position exceeds the current size and update the modified
    /// timestamp; device files delegate.
    pub fn write(&self, id: u64, data: &[u8]) -> KernelResult<usize> {
        let entry = self.open_entry(id)?;
        if !entry.flags.contains(OpenFlags::WRITE) {
            return Err(KernelError::NotPermitted {
                operation: "write to a read-only descriptor",
            });
        }
        let inode = self.inode(entry.ino)?;

        match inode.kind {
            InodeKind::Regular => {
                let mut body = inode.body.write();
                if !body.permissions.owner_can_write() {
                    return Err(KernelError::NotPermitted {
                        operation: "write to a read-only inode",
                    });
                }
                let mut pos = entry.position.lock();
                if entry.flags.contains(OpenFlags::APPEND) {
                    *pos = body.data.len();
                }
                let end = *pos + data.len();
                if end > body.data.len() {
                    body.data.resize(end, 0);
                }
                body.data[*pos..end].copy_from_slice(data);
                *pos = end;
                body.modified = crate::timer::timestamp_secs();
                Ok(data.len())
            }
            InodeKind::Device => {
                let device = inode.body.read().device.ok_or(KernelError::DeviceError {
                    device: "missing device key",
                })?;
                Ok(devices::device_write(device, data))
            }
            _ => Err(KernelError::NotPermitted {
                operation: "write to this inode type",
            }),
        }
    }

    /// Reposition an open file.
    pub fn seek(&self, id: u64, from: SeekFrom) -> KernelResult<usize> {
        let entry = self.open_entry(id)?;
        let inode = self.inode(entry.ino)?;
        let size = inode.size();
        let mut pos = entry.position.lock();

        let new_pos = match from {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => pos
                .checked_add_signed(delta)
                .ok_or(KernelError::Invalid {
                    what: "seek before start of file",
                })?,
            SeekFrom::End(delta) => size.checked_add_signed(delta).ok_or(KernelError::Invalid {
                what: "seek before start of file",
            })?,
        };
        *pos = new_pos;
        Ok(new_pos)
    }

    // -- namespace mutation -------------------------------------------------

    /// Insert a fresh inode under `path`'s parent. Shared by create,
    /// mkdir, and the device nodes.
    fn create_inode(
        &self,
        path: &str,
        kind: InodeKind,
        permissions: Permissions,
        device: Option<DeviceKind>,
    ) -> KernelResult<u64> {
        let (parent_path, name) = split_parent(path)?;
        let parent_ino = self.resolve(parent_path)?;
        let parent = self.inode(parent_ino)?;
        if parent.kind != InodeKind::Directory {
            return Err(KernelError::Invalid {
                what: "parent is not a directory",
            });
        }

        // Hold the structural lock across the existence check and the
        // insertion so two creators cannot race the same name.
        let mut inodes = self.inodes.write();
        let mut parent_body = parent.body.write();
        if parent_body.children.contains_key(name) {
            return Err(KernelError::AlreadyExists { resource: "path" });
        }

        let ino = self.alloc_ino();
        let inode = match (kind, device) {
            (InodeKind::Directory, _) => Inode::new_directory(ino, parent_ino, permissions),
            (InodeKind::Device, Some(dev)) => Inode::new_device(ino, parent_ino, dev),
            _ => Inode::new_regular(ino, parent_ino, permissions),
        };
        inodes.insert(ino, Arc::new(inode));
        parent_body.children.insert(String::from(name), ino);
        parent_body.modified = crate::timer::timestamp_secs();
        Ok(ino)
    }

    /// Create a regular file (the path must not resolve yet) and open it
    /// read-write. Returns the open-file id.
    pub fn create(&self, path: &str, permissions: Permissions) -> KernelResult<u64> {
        if self.resolve(path).is_ok() {
            return Err(KernelError::AlreadyExists { resource: "path" });
        }
        self.create_inode(path, InodeKind::Regular, permissions, None)?;
        self.open(path, OpenFlags::read_write())
    }

    /// Create a directory. The path must not resolve yet.
    pub fn mkdir(&self, path: &str, permissions: Permissions) -> KernelResult<()> {
        if self.resolve(path).is_ok() {
            return Err(KernelError::AlreadyExists { resource: "path" });
        }
        self.create_inode(path, InodeKind::Directory, permissions, None)?;
        Ok(())
    }

    /// Create a device node.
    pub fn mknod_device(&self, path: &str, device: DeviceKind) -> KernelResult<()> {
        if self.resolve(path).is_ok() {
            return Err(KernelError::AlreadyExists { resource: "path" });
        }
        self.create_inode(path, InodeKind::Device, Permissions::default_file(), Some(device))?;
        Ok(())
    }

    /// Snapshot a directory's children.
    pub fn list(&self, path: &str) -> KernelResult<Vec<FileInfo>> {
        let ino = self.resolve(path)?;
        let dir = self.inode(ino)?;
        if dir.kind != InodeKind::Directory {
            return Err(KernelError::Invalid {
                what: "list of a non-directory",
            });
        }

        let children: Vec<(String, u64)> = dir
            .body
            .read()
            .children
            .iter()
            .map(|(name, &ino)| (name.clone(), ino))
            .collect();

        let mut entries = Vec::with_capacity(children.len());
        for (name, child_ino) in children {
            let child = self.inode(child_ino)?;
            let body = child.body.read();
            entries.push(FileInfo {
                name,
                kind: child.kind,
                size: child.size(),
                inode: child_ino,
                permissions: body.permissions,
            });
        }
        Ok(entries)
    }

    /// Remove a non-directory inode. Requires no open references.
    pub fn remove(&self, path: &str) -> KernelResult<()> {
        let ino = self.resolve(path)?;
        let inode = self.inode(ino)?;
        if inode.kind == InodeKind::Directory {
            return Err(KernelError::Invalid {
                what: "remove of a directory (use rmdir)",
            });
        }
        self.unlink(path, ino)
    }

    /// Remove an empty directory. Requires no open references.
    pub fn rmdir(&self, path: &str) -> KernelResult<()> {
        let ino = self.resolve(path)?;
        if ino == ROOT_INODE {
            return Err(KernelError::NotPermitted {
                operation: "remove the root directory",
            });
        }
        let inode = self.inode(ino)?;
        if inode.kind != InodeKind::Directory {
            return Err(KernelError::Invalid {
                what: "rmdir of a non-directory",
            });
        }
        if !inode.body.read().children.is_empty() {
            return Err(KernelError::NotPermitted {
                operation: "remove a non-empty directory",
            });
        }
        self.unlink(path, ino)
    }

    fn unlink(&self, path: &str, ino: u64) -> KernelResult<()> {
        let inode = self.inode(ino)?;
        if inode.ref_count() != 0 {
            return Err(KernelError::NotPermitted {
                operation: "remove an inode with open references",
            });
        }

        let (parent_path, name) = split_parent(path)?;
        let parent_ino = self.resolve(parent_path)?;
        let parent = self.inode(parent_ino)?;

        let mut inodes = self.inodes.write();
        let mut parent_body = parent.body.write();
        parent_body.children.remove(name);
        parent_body.modified = crate::timer::timestamp_secs();
        inodes.remove(&ino);
        Ok(())
    }

    /// Metadata snapshot for one path.
    pub fn stat(&self, path: &str) -> KernelResult<FileInfo> {
        let ino = self.resolve(path)?;
        let inode = self.inode(ino)?;
        let body = inode.body.read();
        let name = path_segments(path)?
            .last()
            .map(|s| String::from(*s))
            .unwrap_or_else(|| String::from("/"));
        Ok(FileInfo {
            name,
            kind: inode.kind,
            size: inode.size(),
            inode: ino,
            permissions: body.permissions,
        })
    }

    /// Number of live open-file entries.
    pub fn open_file_count(&self) -> usize {
        self.open_files.read().len()
    }

    /// Number of inodes in the slab.
    pub fn inode_count(&self) -> usize {
        self.inodes.read().len()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn booted_vfs() -> Vfs {
        let vfs = Vfs::new();
        vfs.init_skeleton().unwrap();
        vfs
    }

    #[test]
    fn skeleton_has_the_standard_directories() {
        let vfs = booted_vfs();
        let mut names: Vec<String> = vfs
            .list("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(
            names,
            ["bin", "dev", "etc", "home", "proc", "sbin", "sys", "tmp", "usr", "var"]
        );

        let dev: Vec<String> = vfs
            .list("/dev")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(dev, ["console", "null", "tty", "zero"]);

        let usr: Vec<String> = vfs
            .list("/usr")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(usr, ["bin", "sbin"]);
    }

    #[test]
    fn create_write_seek_read_round_trip() {
        let vfs = booted_vfs();
        let fd = vfs
            .create("/tmp/a.txt", Permissions::from_mode(0o644))
            .unwrap();
        assert_eq!(vfs.write(fd, b"hi").unwrap(), 2);
        vfs.seek(fd, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        vfs.close(fd).unwrap();
    }

    #[test]
    fn read_past_end_returns_zero_and_write_grows() {
        let vfs = booted_vfs();
        let fd = vfs.create("/tmp/grow", Permissions::default_file()).unwrap();
        vfs.write(fd, b"abc").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 0); // at EOF

        // Writing past the end grows the buffer with a zero gap.
        vfs.seek(fd, SeekFrom::Start(5)).unwrap();
        vfs.write(fd, b"z").unwrap();
        assert_eq!(vfs.stat("/tmp/grow").unwrap().size, 6);
        vfs.seek(fd, SeekFrom::Start(0)).unwrap();
        let mut all = [0u8; 6];
        assert_eq!(vfs.read(fd, &mut all).unwrap(), 6);
        assert_eq!(&all, b"abc\0\0z");
        vfs.close(fd).unwrap();
    }

    #[test]
    fn dev_zero_fills_the_buffer() {
        let vfs = booted_vfs();
        let fd = vfs.open("/dev/zero", OpenFlags::read_only()).unwrap();
        let mut buf = [0xAAu8; 5];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(buf, [0u8; 5]);
        vfs.close(fd).unwrap();
    }

    #[test]
    fn dev_null_is_empty_and_bottomless() {
        let vfs = booted_vfs();
        let fd = vfs
            .open("/dev/null", OpenFlags::read_write())
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 0);
        assert_eq!(vfs.write(fd, b"gone").unwrap(), 4);
        vfs.close(fd).unwrap();
    }

    #[test]
    fn open_close_leaves_refcount_and_table_unchanged() {
        let vfs = booted_vfs();
        let fd0 = vfs.create("/tmp/ref", Permissions::default_file()).unwrap();
        vfs.close(fd0).unwrap();

        let ino = vfs.resolve("/tmp/ref").unwrap();
        let before_refs = vfs.inode(ino).unwrap().ref_count();
        let before_open = vfs.open_file_count();

        let fd = vfs.open("/tmp/ref", OpenFlags::read_only()).unwrap();
        assert_eq!(vfs.inode(ino).unwrap().ref_count(), before_refs + 1);
        vfs.close(fd).unwrap();

        assert_eq!(vfs.inode(ino).unwrap().ref_count(), before_refs);
        assert_eq!(vfs.open_file_count(), before_open);
    }

    #[test]
    fn create_existing_path_is_rejected() {
        let vfs = booted_vfs();
        let fd = vfs.create("/tmp/dup", Permissions::default_file()).unwrap();
        vfs.close(fd).unwrap();
        assert!(matches!(
            vfs.create("/tmp/dup", Permissions::default_file()),
            Err(KernelError::AlreadyExists { .. })
        ));
        assert!(matches!(
            vfs.mkdir("/tmp", Permissions::default_dir()),
            Err(KernelError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn missing_segment_is_not_found() {
        let vfs = booted_vfs();
        assert!(matches!(
            vfs.resolve("/no/such/path"),
            Err(KernelError::NotFound { .. })
        ));
        assert!(matches!(
            vfs.open("/tmp/missing", OpenFlags::read_only()),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn mkdir_rmdir_round_trip_restores_the_tree() {
        let vfs = booted_vfs();
        let before = vfs.inode_count();
        vfs.mkdir("/tmp/scratch", Permissions::default_dir()).unwrap();
        assert_eq!(vfs.inode_count(), before + 1);
        vfs.rmdir("/tmp/scratch").unwrap();
        assert_eq!(vfs.inode_count(), before);
        assert!(vfs.resolve("/tmp/scratch").is_err());
    }

    #[test]
    fn create_remove_round_trip_restores_the_tree() {
        let vfs = booted_vfs();
        let before = vfs.inode_count();
        let fd = vfs.create("/tmp/gone", Permissions::default_file()).unwrap();
        vfs.close(fd).unwrap();
        vfs.remove("/tmp/gone").unwrap();
        assert_eq!(vfs.inode_count(), before);
    }

    #[test]
    fn remove_with_open_reference_is_refused() {
        let vfs = booted_vfs();
        let fd = vfs.create("/tmp/held", Permissions::default_file()).unwrap();
        assert!(matches!(
            vfs.remove("/tmp/held"),
            Err(KernelError::NotPermitted { .. })
        ));
        vfs.close(fd).unwrap();
        vfs.remove("/tmp/held").unwrap();
    }

    #[test]
    fn rmdir_refuses_non_empty_and_root() {
        let vfs = booted_vfs();
        assert!(matches!(
            vfs.rmdir("/usr"),
            Err(KernelError::NotPermitted { .. })
        ));
        assert!(matches!(
            vfs.rmdir("/"),
            Err(KernelError::NotPermitted { .. })
        ));
    }

    #[test]
    fn inode_numbers_are_monotonic_from_two() {
        let vfs = Vfs::new();
        vfs.mkdir("/a", Permissions::default_dir()).unwrap();
        vfs.mkdir("/b", Permissions::default_dir()).unwrap();
        assert_eq!(vfs.resolve("/a").unwrap(), 2);
        assert_eq!(vfs.resolve("/b").unwrap(), 3);
    }

    #[test]
    fn write_to_read_only_inode_is_refused() {
        let vfs = booted_vfs();
        let fd = vfs.create("/tmp/ro", Permissions::read_only()).unwrap();
        assert!(matches!(
            vfs.write(fd, b"x"),
            Err(KernelError::NotPermitted { .. })
        ));
        vfs.close(fd).unwrap();
    }

    #[test]
    fn append_mode_writes_at_the_end() {
        let vfs = booted_vfs();
        let fd = vfs.create("/tmp/log", Permissions::default_file()).unwrap();
        vfs.write(fd, b"one").unwrap();
        vfs.close(fd).unwrap();

        let fd = vfs
            .open(
                "/tmp/log",
                OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::READ,
            )
            .unwrap();
        vfs.write(fd, b"two").unwrap();
        vfs.seek(fd, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"onetwo");
        vfs.close(fd).unwrap();
    }
}
