//! Memory management.
//!
//! Address newtypes shared across the kernel, per-process memory regions,
//! the physical frame allocator, page tables, the virtual memory manager,
//! and the page-fault handler.

#![allow(dead_code)]

use alloc::string::String;

use bitflags::bitflags;

pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod vmm;

pub use frame_allocator::{FrameAllocator, MemoryInfo};
pub use page_table::{PageFlags, PageTable, PageTableEntry};
pub use vmm::Vmm;

/// Size of a page / physical frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Start of the kernel half of the address space (L4 entries 256..512).
pub const KERNEL_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn as_frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / PAGE_SIZE as u64)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn add(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Whether the address falls in the shared kernel half
    /// (L4 index >= 256).
    pub const fn is_kernel_half(&self) -> bool {
        self.0 >= KERNEL_HALF_BASE
    }
}

/// Physical frame number (address / 4096).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub const fn new(num: u64) -> Self {
        Self(num)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * PAGE_SIZE as u64)
    }
}

bitflags! {
    /// Region protection bits, independent of the hardware PTE encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl Protection {
    /// Hardware flags for a user-half leaf mapping with this protection.
    pub fn to_page_flags(self) -> PageFlags {
        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if self.contains(Protection::WRITE) {
            flags |= PageFlags::WRITABLE;
        }
        if !self.contains(Protection::EXEC) {
            flags |= PageFlags::NO_EXECUTE;
        }
        flags
    }
}

/// Optional file backing for a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBacking {
    pub inode: u64,
    pub offset: u64,
}

/// A half-open virtual range [start, end) owned by one address space.
/// Regions within one address space never overlap.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub protection: Protection,
    pub name: String,
    pub backing: Option<FileBacking>,
}

impl MemoryRegion {
    pub fn new(start: VirtualAddress, end: VirtualAddress, protection: Protection, name: &str) -> Self {
        debug_assert!(start.is_page_aligned() && end.is_page_aligned());
        Self {
            start,
            end,
            protection,
            name: String::from(name),
            backing: None,
        }
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        start < self.end && end > self.start
    }

    pub fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn page_count(&self) -> u64 {
        self.len() / PAGE_SIZE as u64
    }
}
