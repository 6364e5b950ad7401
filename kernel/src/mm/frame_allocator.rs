//! Physical frame allocator.
//!
//! Owns every usable RAM frame described by the boot memory map and hands
//! them out one at a time. The free list is LIFO, which favors cache-warm
//! frames; allocate and free are O(1). An owned-frame set catches
//! double-free and free-of-unknown-frame bugs. Out-of-memory is reported,
//! never panicked at this layer; callers decide policy.

use alloc::{collections::BTreeSet, vec::Vec};

use spin::Mutex;

use super::{FrameNumber, PhysicalAddress, PAGE_SIZE};
use crate::{
    boot::RegionType,
    error::{KernelError, KernelResult},
};

/// Memory usage report, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

#[derive(Debug, Default)]
struct FrameAllocatorInner {
    /// LIFO free list of frame numbers.
    free_list: Vec<FrameNumber>,
    /// Every frame currently handed out. Guards against double free and
    /// freeing frames the allocator never owned.
    owned: BTreeSet<FrameNumber>,
    /// Total frames contributed by add_region.
    total_frames: u64,
    /// Lifetime allocation counter.
    allocations: u64,
}

/// The physical frame allocator. All operations serialize on one lock.
pub struct FrameAllocator {
    inner: Mutex<FrameAllocatorInner>,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(FrameAllocatorInner {
                free_list: Vec::new(),
                owned: BTreeSet::new(),
                total_frames: 0,
                allocations: 0,
            }),
        }
    }

    /// Register one region of the boot memory map. Only RAM contributes
    /// frames; the range is rounded inward to page boundaries.
    pub fn add_region(&self, base: PhysicalAddress, length: u64, kind: RegionType) {
        if !kind.is_usable() || length == 0 {
            return;
        }

        let start = base.align_up();
        let end = PhysicalAddress::new(base.as_u64().saturating_add(length)).align_down();
        if end <= start {
            return;
        }

        let first = start.as_frame().as_u64();
        let last = end.as_frame().as_u64();

        let mut inner = self.inner.lock();
        inner.free_list.reserve((last - first) as usize);
        for frame in first..last {
            inner.free_list.push(FrameNumber::new(frame));
        }
        inner.total_frames += last - first;

        log::debug!(
            "frames: added region {:#x}..{:#x} ({} frames)",
            start.as_u64(),
            end.as_u64(),
            last - first
        );
    }

    /// Allocate one frame. O(1); LIFO.
    pub fn allocate(&self) -> KernelResult<FrameNumber> {
        let mut inner = self.inner.lock();
        let frame = inner.free_list.pop().ok_or(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })?;
        inner.owned.insert(frame);
        inner.allocations += 1;
        Ok(frame)
    }

    /// Return one frame to the pool. O(1) apart from the ownership check.
    /// Freeing a frame that is not currently owned is a bug in the caller.
    pub fn free(&self, frame: FrameNumber) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        if !inner.owned.remove(&frame) {
            debug_assert!(false, "free of unowned frame {:#x}", frame.as_u64());
            return Err(KernelError::Invalid {
                what: "frame not currently owned",
            });
        }
        inner.free_list.push(frame);
        Ok(())
    }

    /// Memory usage in bytes.
    pub fn info(&self) -> MemoryInfo {
        let inner = self.inner.lock();
        let total = inner.total_frames * PAGE_SIZE as u64;
        let free = inner.free_list.len() as u64 * PAGE_SIZE as u64;
        MemoryInfo {
            total,
            free,
            used: total - free,
        }
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> u64 {
        self.inner.lock().free_list.len() as u64
    }

    /// Number of frames contributed by all registered regions.
    pub fn total_frames(&self) -> u64 {
        self.inner.lock().total_frames
    }

    /// Whether the frame is currently handed out.
    pub fn is_owned(&self, frame: FrameNumber) -> bool {
        self.inner.lock().owned.contains(&frame)
    }

    /// Number of frames currently handed out.
    pub fn owned_frames(&self) -> u64 {
        self.inner.lock().owned.len() as u64
    }

    /// Lifetime allocation count.
    pub fn allocation_count(&self) -> u64 {
        self.inner.lock().allocations
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn allocator_with_frames(count: u64) -> FrameAllocator {
        let fa = FrameAllocator::new();
        fa.add_region(
            PhysicalAddress::new(0x10_0000),
            count * PAGE_SIZE as u64,
            RegionType::Ram,
        );
        fa
    }

    #[test]
    fn allocate_is_lifo() {
        let fa = allocator_with_frames(4);
        let first = fa.allocate().expect("allocation from fresh pool");
        fa.free(first).expect("free of just-allocated frame");
        let second = fa.allocate().expect("re-allocation");
        assert_eq!(first, second);
    }

    #[test]
    fn allocate_free_restores_pool_size() {
        let fa = allocator_with_frames(8);
        let before = fa.free_frames();
        let frame = fa.allocate().unwrap();
        assert_eq!(fa.free_frames(), before - 1);
        fa.free(frame).unwrap();
        assert_eq!(fa.free_frames(), before);
    }

    #[test]
    fn repeated_cycles_do_not_leak() {
        let fa = allocator_with_frames(8);
        let before = fa.free_frames();
        for _ in 0..100 {
            let frame = fa.allocate().unwrap();
            fa.free(frame).unwrap();
        }
        assert_eq!(fa.free_frames(), before);
        assert_eq!(fa.allocation_count(), 100);
    }

    #[test]
    fn exhaustion_reports_out_of_memory_and_recovers() {
        let fa = allocator_with_frames(2);
        let a = fa.allocate().unwrap();
        let b = fa.allocate().unwrap();
        assert!(matches!(
            fa.allocate(),
            Err(KernelError::OutOfMemory { .. })
        ));
        fa.free(b).unwrap();
        assert!(fa.allocate().is_ok());
        let _ = a;
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn double_free_is_rejected() {
        let fa = allocator_with_frames(2);
        let frame = fa.allocate().unwrap();
        fa.free(frame).unwrap();
        assert!(fa.free(frame).is_err());
    }

    #[test]
    fn non_ram_regions_contribute_nothing() {
        let fa = FrameAllocator::new();
        fa.add_region(PhysicalAddress::new(0x10_0000), 0x10000, RegionType::Reserved);
        fa.add_region(PhysicalAddress::new(0x20_0000), 0x10000, RegionType::Acpi);
        assert_eq!(fa.total_frames(), 0);
        assert!(fa.allocate().is_err());
    }

    #[test]
    fn unaligned_region_rounds_inward() {
        let fa = FrameAllocator::new();
        // 0x100800..0x103800 rounds to 0x101000..0x103000 = 2 frames.
        fa.add_region(PhysicalAddress::new(0x10_0800), 0x3000, RegionType::Ram);
        assert_eq!(fa.total_frames(), 2);
    }

    #[test]
    fn info_reports_bytes() {
        let fa = allocator_with_frames(4);
        let _held = fa.allocate().unwrap();
        let info = fa.info();
        assert_eq!(info.total, 4 * PAGE_SIZE as u64);
        assert_eq!(info.free, 3 * PAGE_SIZE as u64);
        assert_eq!(info.used, PAGE_SIZE as u64);
    }
}
