//! Virtual memory manager.
//!
//! Owns per-process page tables and translates virtual to physical
//! addresses. Table contents are kept in an arena keyed by the owning
//! frame number, so every cross-table reference is an index rather than a
//! pointer; boot code writes the same contents through to the
//! identity-mapped frames before installing a root.
//!
//! The address space is split in half: the lower half (L4 entries 0..256)
//! is exclusive to its process, the upper half is a shared kernel master
//! whose L4 entries are copied by reference into every address space at
//! creation. Two address spaces observe bit-identical kernel-half entries
//! at all times because they point at the same master tables.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};

use spin::{Mutex, RwLock};

use super::{
    page_table::{PageFlags, PageTable, PageTableEntry, VirtAddrParts},
    FrameAllocator, FrameNumber, MemoryRegion, PhysicalAddress, VirtualAddress, KERNEL_HALF_BASE,
    PAGE_SIZE,
};
use crate::{
    error::{KernelError, KernelResult},
    process::Pid,
};

/// How much physical RAM the boot direct map covers (MiB).
pub const DIRECT_MAP_MIB: u64 = 16;

/// Top of the user stack area; stacks grow down from here.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_0000;

/// Base of the user heap, adjusted by `brk`.
pub const USER_HEAP_BASE: u64 = 0x4000_0000;

/// Base of the mmap area.
pub const MMAP_BASE: u64 = 0x5000_0000;

/// Physical address reachable by kernel code through the boot direct map.
pub fn phys_to_virt(phys: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(KERNEL_HALF_BASE + phys.as_u64())
}

/// Flush one TLB entry on the running CPU.
fn flush_tlb(virt: VirtualAddress) {
    #[cfg(target_os = "none")]
    crate::arch::x86_64::hal::invlpg(virt.as_u64());
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Zero a freshly allocated frame.
fn zero_frame(frame: FrameNumber) {
    #[cfg(target_os = "none")]
    {
        let virt = phys_to_virt(frame.as_addr()).as_u64() as *mut u8;
        // SAFETY: The frame was just handed out by the allocator, lies in
        // RAM covered by the boot direct map, and nothing else references
        // it yet.
        unsafe {
            core::ptr::write_bytes(virt, 0, PAGE_SIZE);
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = frame;
}

/// Zero a freshly allocated frame before it becomes visible to user code
/// (demand-zero faults rely on this).
pub fn zero_user_frame(frame: FrameNumber) {
    zero_frame(frame);
}

/// Copy one frame's contents to another.
fn copy_frame(dst: FrameNumber, src: FrameNumber) {
    #[cfg(target_os = "none")]
    {
        let src_virt = phys_to_virt(src.as_addr()).as_u64() as *const u8;
        let dst_virt = phys_to_virt(dst.as_addr()).as_u64() as *mut u8;
        // SAFETY: Both frames lie in direct-mapped RAM; `dst` was just
        // allocated and is not aliased, `src` is read-only here.
        unsafe {
            core::ptr::copy_nonoverlapping(src_virt, dst_virt, PAGE_SIZE);
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (dst, src);
    }
}

// ---------------------------------------------------------------------------
// Table arena
// ---------------------------------------------------------------------------

/// Page-table contents keyed by the frame that holds them.
#[derive(Default)]
struct TableArena {
    tables: BTreeMap<u64, Box<PageTable>>,
}

impl TableArena {
    fn insert(&mut self, frame: FrameNumber, table: Box<PageTable>) {
        self.tables.insert(frame.as_u64(), table);
    }

    fn get(&self, frame: FrameNumber) -> Option<&PageTable> {
        self.tables.get(&frame.as_u64()).map(|t| t.as_ref())
    }

    fn get_mut(&mut self, frame: FrameNumber) -> Option<&mut PageTable> {
        self.tables.get_mut(&frame.as_u64()).map(|t| t.as_mut())
    }

    fn frames(&self) -> impl Iterator<Item = FrameNumber> + '_ {
        self.tables.keys().map(|&f| FrameNumber::new(f))
    }
}

// ---------------------------------------------------------------------------
// Kernel master (upper half)
// ---------------------------------------------------------------------------

/// The shared kernel half: master L4 entries 256..512 plus the tables they
/// reference. Built once at boot, read by every address space afterwards.
pub struct KernelSpace {
    upper: [PageTableEntry; 256],
    arena: TableArena,
}

impl KernelSpace {
    fn new() -> Self {
        Self {
            upper: [PageTableEntry::empty(); 256],
            arena: TableArena::default(),
        }
    }

    /// Map one kernel-half page.
    fn map_page(
        &mut self,
        frames: &FrameAllocator,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        debug_assert!(virt.is_kernel_half());
        let parts = VirtAddrParts::new(virt);
        let table_flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL;

        let l3_frame = {
            let entry = &mut self.upper[parts.l4 - 256];
            if let Some(frame) = entry.frame() {
                frame
            } else {
                let frame = frames.allocate()?;
                zero_frame(frame);
                self.arena.insert(frame, Box::new(PageTable::new()));
                entry.set(frame, table_flags);
                frame
            }
        };

        let l2_frame = {
            let l3 = self
                .arena
                .get_mut(l3_frame)
                .ok_or(KernelError::Fatal {
                    reason: "kernel L3 table missing from arena",
                })?;
            let entry = &mut l3[parts.l3];
            if let Some(frame) = entry.frame() {
                frame
            } else {
                let frame = frames.allocate()?;
                zero_frame(frame);
                entry.set(frame, table_flags);
                frame
            }
        };
        if self.arena.get(l2_frame).is_none() {
            self.arena.insert(l2_frame, Box::new(PageTable::new()));
        }

        let l1_frame = {
            let l2 = self
                .arena
                .get_mut(l2_frame)
                .ok_or(KernelError::Fatal {
                    reason: "kernel L2 table missing from arena",
                })?;
            let entry = &mut l2[parts.l2];
            if let Some(frame) = entry.frame() {
                frame
            } else {
                let frame = frames.allocate()?;
                zero_frame(frame);
                entry.set(frame, table_flags);
                frame
            }
        };
        if self.arena.get(l1_frame).is_none() {
            self.arena.insert(l1_frame, Box::new(PageTable::new()));
        }

        let l1 = self.arena.get_mut(l1_frame).ok_or(KernelError::Fatal {
            reason: "kernel L1 table missing from arena",
        })?;
        l1[parts.l1].set(phys.as_frame(), flags);
        flush_tlb(virt);
        Ok(())
    }

    /// Walk the kernel half for an address.
    fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let parts = VirtAddrParts::new(virt);
        let l3_frame = self.upper[parts.l4 - 256].frame()?;
        let l2_frame = self.arena.get(l3_frame)?[parts.l3].frame()?;
        let l1_frame = self.arena.get(l2_frame)?[parts.l2].frame()?;
        let entry = &self.arena.get(l1_frame)?[parts.l1];
        let frame = entry.frame()?;
        Some(PhysicalAddress::new(
            frame.as_addr().as_u64() + parts.offset as u64,
        ))
    }

    /// Map the first `mib` MiB of physical RAM at the direct-map base so
    /// kernel code can reach any physical address.
    fn build_direct_map(&mut self, frames: &FrameAllocator, mib: u64) -> KernelResult<()> {
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL;
        let pages = mib * 1024 * 1024 / PAGE_SIZE as u64;
        for page in 0..pages {
            let phys = PhysicalAddress::new(page * PAGE_SIZE as u64);
            self.map_page(frames, phys_to_virt(phys), phys, flags)?;
        }
        Ok(())
    }

    /// The master upper-half L4 entries, copied into each new root.
    fn upper_entries(&self) -> [PageTableEntry; 256] {
        self.upper
    }
}

// ---------------------------------------------------------------------------
// Per-process address space
// ---------------------------------------------------------------------------

/// One process's page-table hierarchy and region list. The upper half of
/// the root is a copy of the kernel master; the lower half belongs to the
/// process alone.
pub struct AddressSpace {
    pid: Pid,
    root: FrameNumber,
    arena: TableArena,
    regions: Vec<MemoryRegion>,
}

impl AddressSpace {
    fn new(
        frames: &FrameAllocator,
        pid: Pid,
        kernel_upper: &[PageTableEntry; 256],
    ) -> KernelResult<Self> {
        let root = frames.allocate()?;
        zero_frame(root);
        let mut table = Box::new(PageTable::new());
        for (i, entry) in kernel_upper.iter().enumerate() {
            table[256 + i] = *entry;
        }
        let mut arena = TableArena::default();
        arena.insert(root, table);
        Ok(Self {
            pid,
            root,
            arena,
            regions: Vec::new(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Physical address of the L4 table, suitable for CR3.
    pub fn root_addr(&self) -> PhysicalAddress {
        self.root.as_addr()
    }

    /// Raw bits of the upper-half L4 entries, for the sharing invariant.
    pub fn upper_half_bits(&self) -> [u64; 256] {
        let root = self.arena.get(self.root).expect("root table in arena");
        let mut bits = [0u64; 256];
        for (i, slot) in bits.iter_mut().enumerate() {
            *slot = root[256 + i].bits();
        }
        bits
    }

    /// Install a 4 KiB mapping, replacing any prior mapping at `virt`.
    pub fn map(
        &mut self,
        frames: &FrameAllocator,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if virt.is_kernel_half() {
            return Err(KernelError::NotPermitted {
                operation: "map kernel-half address through a process space",
            });
        }
        if !virt.is_page_aligned() || !phys.is_page_aligned() {
            return Err(KernelError::Invalid {
                what: "unaligned map request",
            });
        }

        let parts = VirtAddrParts::new(virt);
        // Intermediate tables carry USER so user-half leaves are reachable
        // from ring 3; the leaf itself decides final access.
        let table_flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;

        let l3_frame = self.descend(frames, self.root, parts.l4, table_flags)?;
        let l2_frame = self.descend(frames, l3_frame, parts.l3, table_flags)?;
        let l1_frame = self.descend(frames, l2_frame, parts.l2, table_flags)?;

        let l1 = self.arena.get_mut(l1_frame).ok_or(KernelError::Fatal {
            reason: "L1 table missing from arena",
        })?;
        l1[parts.l1].set(phys.as_frame(), flags);
        flush_tlb(virt);
        Ok(())
    }

    fn descend(
        &mut self,
        frames: &FrameAllocator,
        table_frame: FrameNumber,
        index: usize,
        table_flags: PageFlags,
    ) -> KernelResult<FrameNumber> {
        let table = self.arena.get_mut(table_frame).ok_or(KernelError::Fatal {
            reason: "page table missing from arena",
        })?;
        let next = table[index].frame();
        let frame = match next {
            Some(f) => f,
            None => {
                let f = frames.allocate()?;
                zero_frame(f);
                table[index].set(f, table_flags);
                f
            }
        };
        if self.arena.get(frame).is_none() {
            self.arena.insert(frame, Box::new(PageTable::new()));
        }
        Ok(frame)
    }

    /// Clear the mapping at `virt` and return the frame it pointed to.
    /// The frame itself is not freed; the caller owns that decision.
    pub fn unmap(&mut self, virt: VirtualAddress) -> KernelResult<FrameNumber> {
        let entry = self.leaf_entry(virt)?.ok_or(KernelError::NotFound {
            resource: "mapping",
        })?;
        let frame = entry.frame().ok_or(KernelError::NotFound {
            resource: "mapping",
        })?;
        self.update_leaf(virt, |e| e.clear())?;
        flush_tlb(virt);
        Ok(frame)
    }

    /// Walk the page tables for `virt` within the lower half.
    pub fn translate_lower(&self, virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
        let parts = VirtAddrParts::new(virt);
        let entry = self
            .leaf_entry(virt)?
            .ok_or(KernelError::NotFound {
                resource: "mapping",
            })?;
        let frame = entry.frame().ok_or(KernelError::NotFound {
            resource: "mapping",
        })?;
        Ok(PhysicalAddress::new(
            frame.as_addr().as_u64() + parts.offset as u64,
        ))
    }

    /// The leaf PTE covering `virt`, if every level above it is present.
    pub fn leaf_entry(&self, virt: VirtualAddress) -> KernelResult<Option<PageTableEntry>> {
        if virt.is_kernel_half() {
            return Err(KernelError::NotPermitted {
                operation: "walk kernel-half address through a process space",
            });
        }
        let parts = VirtAddrParts::new(virt);
        let root = self.arena.get(self.root).ok_or(KernelError::Fatal {
            reason: "root table missing from arena",
        })?;
        let Some(l3_frame) = root[parts.l4].frame() else {
            return Ok(None);
        };
        let Some(l3) = self.arena.get(l3_frame) else {
            return Ok(None);
        };
        let Some(l2_frame) = l3[parts.l3].frame() else {
            return Ok(None);
        };
        let Some(l2) = self.arena.get(l2_frame) else {
            return Ok(None);
        };
        let Some(l1_frame) = l2[parts.l2].frame() else {
            return Ok(None);
        };
        let Some(l1) = self.arena.get(l1_frame) else {
            return Ok(None);
        };
        Ok(Some(l1[parts.l1]))
    }

    fn update_leaf(
        &mut self,
        virt: VirtualAddress,
        f: impl FnOnce(&mut PageTableEntry),
    ) -> KernelResult<()> {
        let parts = VirtAddrParts::new(virt);
        let root = self.arena.get(self.root).ok_or(KernelError::Fatal {
            reason: "root table missing from arena",
        })?;
        let l3_frame = root[parts.l4].frame().ok_or(KernelError::NotFound {
            resource: "mapping",
        })?;
        let l2_frame = self
            .arena
            .get(l3_frame)
            .and_then(|t| t[parts.l3].frame())
            .ok_or(KernelError::NotFound {
                resource: "mapping",
            })?;
        let l1_frame = self
            .arena
            .get(l2_frame)
            .and_then(|t| t[parts.l2].frame())
            .ok_or(KernelError::NotFound {
                resource: "mapping",
            })?;
        let l1 = self.arena.get_mut(l1_frame).ok_or(KernelError::NotFound {
            resource: "mapping",
        })?;
        f(&mut l1[parts.l1]);
        Ok(())
    }

    // -- region bookkeeping -------------------------------------------------

    /// Register a region; regions within one address space never overlap.
    pub fn add_region(&mut self, region: MemoryRegion) -> KernelResult<()> {
        if region.start >= region.end {
            return Err(KernelError::Invalid {
                what: "empty or inverted region",
            });
        }
        if self
            .regions
            .iter()
            .any(|r| r.overlaps(region.start, region.end))
        {
            return Err(KernelError::AlreadyExists {
                resource: "overlapping memory region",
            });
        }
        self.regions.push(region);
        Ok(())
    }

    pub fn find_region(&self, addr: VirtualAddress) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    pub fn find_region_mut(&mut self, addr: VirtualAddress) -> Option<&mut MemoryRegion> {
        self.regions.iter_mut().find(|r| r.contains(addr))
    }

    pub fn remove_region(&mut self, start: VirtualAddress) -> Option<MemoryRegion> {
        let idx = self.regions.iter().position(|r| r.start == start)?;
        Some(self.regions.swap_remove(idx))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Every present lower-half leaf mapping, for teardown.
    pub fn mapped_pages(&self) -> Vec<(VirtualAddress, PageTableEntry)> {
        let mut pages = Vec::new();
        let root = match self.arena.get(self.root) {
            Some(t) => t,
            None => return pages,
        };
        for l4 in 0..256 {
            let Some(l3_frame) = root[l4].frame() else {
                continue;
            };
            let Some(l3) = self.arena.get(l3_frame) else {
                continue;
            };
            for i3 in 0..512 {
                let Some(l2_frame) = l3[i3].frame() else {
                    continue;
                };
                let Some(l2) = self.arena.get(l2_frame) else {
                    continue;
                };
                for i2 in 0..512 {
                    let Some(l1_frame) = l2[i2].frame() else {
                        continue;
                    };
                    let Some(l1) = self.arena.get(l1_frame) else {
                        continue;
                    };
                    for i1 in 0..512 {
                        let entry = l1[i1];
                        if entry.is_present() {
                            let virt = ((l4 as u64) << 39)
                                | ((i3 as u64) << 30)
                                | ((i2 as u64) << 21)
                                | ((i1 as u64) << 12);
                            pages.push((VirtualAddress::new(virt), entry));
                        }
                    }
                }
            }
        }
        pages
    }

    /// Frames holding this space's page tables (root included).
    pub fn table_frames(&self) -> Vec<FrameNumber> {
        self.arena.frames().collect()
    }
}

// ---------------------------------------------------------------------------
// VMM
// ---------------------------------------------------------------------------

/// How a COW fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowResolution {
    /// Sole holder: the page was made writable in place.
    MadeWritable,
    /// The page was copied to a private frame.
    Copied(FrameNumber),
}

/// The virtual memory manager: the kernel master, all process address
/// spaces, and the shared-frame refcounts used by COW.
pub struct Vmm {
    kernel_space: RwLock<KernelSpace>,
    spaces: RwLock<BTreeMap<Pid, Arc<Mutex<AddressSpace>>>>,
    shared: Mutex<BTreeMap<u64, usize>>,
}

impl Vmm {
    pub fn new() -> Self {
        Self {
            kernel_space: RwLock::new(KernelSpace::new()),
            spaces: RwLock::new(BTreeMap::new()),
            shared: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build the kernel master: direct-map the first [`DIRECT_MAP_MIB`]
    /// MiB of physical RAM into the upper half. Called once at boot,
    /// before the first address space exists.
    pub fn init_kernel_space(&self, frames: &FrameAllocator) -> KernelResult<()> {
        self.kernel_space
            .write()
            .build_direct_map(frames, DIRECT_MAP_MIB)
    }

    /// Allocate a top-level table for `pid`, seed its upper half from the
    /// kernel master, and install it.
    pub fn create_address_space(&self, frames: &FrameAllocator, pid: Pid) -> KernelResult<()> {
        let mut spaces = self.spaces.write();
        if spaces.contains_key(&pid) {
            return Err(KernelError::AlreadyExists {
                resource: "address space",
            });
        }
        let upper = self.kernel_space.read().upper_entries();
        let space = AddressSpace::new(frames, pid, &upper)?;
        spaces.insert(pid, Arc::new(Mutex::new(space)));
        Ok(())
    }

    /// Tear down `pid`'s address space: unmap and free every user frame
    /// (COW-aware) and release the page-table frames.
    pub fn destroy_address_space(&self, frames: &FrameAllocator, pid: Pid) -> KernelResult<()> {
        let space = self
            .spaces
            .write()
            .remove(&pid)
            .ok_or(KernelError::NotFound {
                resource: "address space",
            })?;
        let space = space.lock();

        for (_, entry) in space.mapped_pages() {
            if let Some(frame) = entry.frame() {
                self.release_user_frame(frames, frame, entry.flags());
            }
        }
        for frame in space.table_frames() {
            let _ = frames.free(frame);
        }
        Ok(())
    }

    /// Unmap one page and release its frame, honoring COW sharing.
    /// Returns true when a mapping existed.
    pub fn unmap_and_release(
        &self,
        frames: &FrameAllocator,
        pid: Pid,
        virt: VirtualAddress,
    ) -> KernelResult<bool> {
        let entry = self.with_space(pid, |space| space.leaf_entry(virt))?;
        let Some(entry) = entry.filter(|e| e.is_present()) else {
            return Ok(false);
        };
        let frame = self.unmap(pid, virt)?;
        self.release_user_frame(frames, frame, entry.flags());
        Ok(true)
    }

    /// Drop a user frame reference, honoring COW sharing.
    fn release_user_frame(&self, frames: &FrameAllocator, frame: FrameNumber, flags: PageFlags) {
        if flags.contains(PageFlags::COW) {
            let mut shared = self.shared.lock();
            match shared.get_mut(&frame.as_u64()) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    return;
                }
                _ => {
                    shared.remove(&frame.as_u64());
                }
            }
        }
        let _ = frames.free(frame);
    }

    /// Run `f` with exclusive access to `pid`'s address space.
    pub fn with_space<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut AddressSpace) -> KernelResult<R>,
    ) -> KernelResult<R> {
        let space = self
            .spaces
            .read()
            .get(&pid)
            .cloned()
            .ok_or(KernelError::NotFound {
                resource: "address space",
            })?;
        let mut guard = space.lock();
        f(&mut guard)
    }

    /// Install a PTE at 4 KiB granularity; replaces any prior mapping.
    pub fn map(
        &self,
        frames: &FrameAllocator,
        pid: Pid,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        self.with_space(pid, |space| space.map(frames, virt, phys, flags))
    }

    /// Clear a PTE. Does not free the underlying frame.
    pub fn unmap(&self, pid: Pid, virt: VirtualAddress) -> KernelResult<FrameNumber> {
        self.with_space(pid, |space| space.unmap(virt))
    }

    /// Walk the page tables for `virt` in `pid`'s address space.
    pub fn translate(&self, pid: Pid, virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
        if virt.is_kernel_half() {
            return self
                .kernel_space
                .read()
                .translate(virt)
                .ok_or(KernelError::NotFound {
                    resource: "mapping",
                });
        }
        self.with_space(pid, |space| space.translate_lower(virt))
    }

    /// Convert an exclusive mapping into a shared, write-protected one and
    /// bump the shared-frame refcount.
    pub fn copy_on_write_mark(&self, pid: Pid, virt: VirtualAddress) -> KernelResult<FrameNumber> {
        let frame = self.with_space(pid, |space| {
            let entry = space
                .leaf_entry(virt)?
                .filter(|e| e.is_present())
                .ok_or(KernelError::NotFound {
                    resource: "mapping",
                })?;
            let frame = entry.frame().expect("present entry has a frame");
            let mut flags = entry.flags();
            flags.remove(PageFlags::WRITABLE);
            flags.insert(PageFlags::COW);
            space.update_leaf(virt, |e| e.set_flags(flags))?;
            flush_tlb(virt);
            Ok(frame)
        })?;
        *self.shared.lock().entry(frame.as_u64()).or_insert(0) += 1;
        Ok(frame)
    }

    /// Current refcount of a COW-shared frame (0 if not shared).
    pub fn cow_refcount(&self, frame: FrameNumber) -> usize {
        self.shared.lock().get(&frame.as_u64()).copied().unwrap_or(0)
    }

    /// Resolve a write to a COW page: the sole holder gets the page made
    /// writable in place, otherwise the page is copied to a fresh frame.
    pub fn handle_cow_fault(
        &self,
        frames: &FrameAllocator,
        pid: Pid,
        virt: VirtualAddress,
    ) -> KernelResult<CowResolution> {
        let page = virt.align_down();
        let entry = self
            .with_space(pid, |space| {
                space.leaf_entry(page)?.ok_or(KernelError::NotFound {
                    resource: "mapping",
                })
            })?;

        if !entry.flags().contains(PageFlags::COW) {
            return Err(KernelError::Invalid {
                what: "write fault on a page not marked copy-on-write",
            });
        }
        let old_frame = entry.frame().ok_or(KernelError::NotFound {
            resource: "mapping",
        })?;

        let mut shared = self.shared.lock();
        let count = shared.get(&old_frame.as_u64()).copied().unwrap_or(1);

        if count <= 1 {
            shared.remove(&old_frame.as_u64());
            drop(shared);
            self.with_space(pid, |space| {
                let mut flags = entry.flags();
                flags.remove(PageFlags::COW);
                flags.insert(PageFlags::WRITABLE);
                space.update_leaf(page, |e| e.set_flags(flags))?;
                flush_tlb(page);
                Ok(())
            })?;
            Ok(CowResolution::MadeWritable)
        } else {
            let new_frame = frames.allocate()?;
            copy_frame(new_frame, old_frame);
            if let Some(c) = shared.get_mut(&old_frame.as_u64()) {
                *c -= 1;
            }
            drop(shared);
            self.with_space(pid, |space| {
                let mut flags = entry.flags();
                flags.remove(PageFlags::COW);
                flags.insert(PageFlags::WRITABLE);
                space.update_leaf(page, |e| e.set(new_frame, flags))?;
                flush_tlb(page);
                Ok(())
            })?;
            Ok(CowResolution::Copied(new_frame))
        }
    }

    /// Whether `pid` has an address space installed.
    pub fn has_space(&self, pid: Pid) -> bool {
        self.spaces.read().contains_key(&pid)
    }
}

impl Default for Vmm {
    fn default() -> Self {
        Self::new()
    }
}
