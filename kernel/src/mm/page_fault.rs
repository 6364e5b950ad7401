//! Page-fault handler.
//!
//! The architecture trap handler decodes the CPU-supplied error code and
//! faulting address into a [`PageFaultInfo`] and delegates here. Faults are
//! classified in order: reserved-bit corruption (fatal), demand-zero for
//! not-present addresses inside a valid region (major fault), copy-on-write
//! for write faults on write-protected pages of writable regions (minor
//! fault), everything else escalates to the caller, which terminates the
//! process or panics for kernel-context faults.
//!
//! Every transition logs (address, pid, rip, error code) to the audit
//! channel.

use bitflags::bitflags;

use super::{
    vmm::{CowResolution, Vmm},
    FrameAllocator, Protection, VirtualAddress,
};
use crate::{
    error::{KernelError, KernelResult},
    process::Pid,
};

bitflags! {
    /// x86-64 page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u64 {
        /// Fault on a present page (protection violation) rather than a
        /// non-present one.
        const PRESENT           = 1 << 0;
        /// The access was a write.
        const WRITE             = 1 << 1;
        /// The access came from user mode.
        const USER              = 1 << 2;
        /// A reserved bit was set in a paging structure.
        const RESERVED_BIT      = 1 << 3;
        /// The access was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Everything the trap handler knows about one fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The faulting virtual address (CR2).
    pub address: VirtualAddress,
    /// Decoded error code.
    pub code: PageFaultCode,
    /// Process that took the fault.
    pub pid: Pid,
    /// Instruction pointer at the time of the fault.
    pub rip: u64,
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// A fresh zeroed frame was mapped (counts as a major fault).
    DemandZero,
    /// A copy-on-write page was resolved (counts as a minor fault).
    Cow(CowResolution),
}

/// Classify and resolve a page fault.
///
/// Returns the resolution on success. A `Fatal` error means page-table
/// corruption and must panic; any other error means the access was truly
/// illegal and the caller terminates the process (or panics if the fault
/// came from kernel context).
pub fn handle_page_fault(
    frames: &FrameAllocator,
    vmm: &Vmm,
    info: &PageFaultInfo,
) -> KernelResult<FaultResolution> {
    log::debug!(
        "page fault: addr={:#x} pid={} rip={:#x} code={:?}",
        info.address.as_u64(),
        info.pid,
        info.rip,
        info.code
    );

    if info.code.contains(PageFaultCode::RESERVED_BIT) {
        log::error!(
            "page-table corruption: reserved bit set, addr={:#x} pid={}",
            info.address.as_u64(),
            info.pid
        );
        return Err(KernelError::Fatal {
            reason: "reserved bit set in page table",
        });
    }

    let page = info.address.align_down();
    let region = vmm.with_space(info.pid, |space| Ok(space.find_region(page).cloned()))?;

    if !info.code.contains(PageFaultCode::PRESENT) {
        // Not-present fault: demand-zero if the address lies in a valid
        // region and the access kind is allowed there.
        let Some(region) = region else {
            log::warn!(
                "illegal access to unmapped {:#x} by pid {} at rip {:#x}",
                info.address.as_u64(),
                info.pid,
                info.rip
            );
            return Err(KernelError::NotFound {
                resource: "memory region",
            });
        };

        if info.code.contains(PageFaultCode::WRITE)
            && !region.protection.contains(Protection::WRITE)
        {
            return Err(KernelError::NotPermitted {
                operation: "write to read-only region",
            });
        }
        if info.code.contains(PageFaultCode::INSTRUCTION_FETCH)
            && !region.protection.contains(Protection::EXEC)
        {
            return Err(KernelError::NotPermitted {
                operation: "execute from non-executable region",
            });
        }

        let frame = frames.allocate()?;
        super::vmm::zero_user_frame(frame);
        vmm.map(
            frames,
            info.pid,
            page,
            frame.as_addr(),
            region.protection.to_page_flags(),
        )?;
        log::debug!(
            "demand-zero: mapped {:#x} -> frame {:#x} for pid {}",
            page.as_u64(),
            frame.as_u64(),
            info.pid
        );
        return Ok(FaultResolution::DemandZero);
    }

    if info.code.contains(PageFaultCode::WRITE) {
        // Present + write: copy-on-write if the region says writable but
        // the PTE says read-only.
        let writable_region = region
            .as_ref()
            .is_some_and(|r| r.protection.contains(Protection::WRITE));
        if writable_region {
            let resolution = vmm.handle_cow_fault(frames, info.pid, page)?;
            log::debug!(
                "cow: resolved write to {:#x} for pid {} ({:?})",
                page.as_u64(),
                info.pid,
                resolution
            );
            return Ok(FaultResolution::Cow(resolution));
        }
        return Err(KernelError::NotPermitted {
            operation: "write to read-only region",
        });
    }

    log::warn!(
        "unresolvable fault at {:#x} by pid {} (code {:?})",
        info.address.as_u64(),
        info.pid,
        info.code
    );
    Err(KernelError::NotPermitted {
        operation: "illegal memory access",
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::{
        boot::RegionType,
        mm::{MemoryRegion, PhysicalAddress},
    };

    fn setup() -> (FrameAllocator, Vmm) {
        let frames = FrameAllocator::new();
        frames.add_region(
            PhysicalAddress::new(0x10_0000),
            0x100_0000,
            RegionType::Ram,
        );
        let vmm = Vmm::new();
        vmm.init_kernel_space(&frames).unwrap();
        vmm.create_address_space(&frames, 1).unwrap();
        (frames, vmm)
    }

    fn add_rw_region(vmm: &Vmm, start: u64, end: u64) {
        vmm.with_space(1, |s| {
            s.add_region(MemoryRegion::new(
                VirtualAddress::new(start),
                VirtualAddress::new(end),
                Protection::READ | Protection::WRITE,
                "test",
            ))
        })
        .unwrap();
    }

    #[test]
    fn demand_zero_maps_a_fresh_frame() {
        let (frames, vmm) = setup();
        add_rw_region(&vmm, 0x4000_0000, 0x4000_1000);

        let info = PageFaultInfo {
            address: VirtualAddress::new(0x4000_0000),
            code: PageFaultCode::USER | PageFaultCode::WRITE,
            pid: 1,
            rip: 0x1000,
        };
        let resolution = handle_page_fault(&frames, &vmm, &info).unwrap();
        assert_eq!(resolution, FaultResolution::DemandZero);
        assert!(vmm.translate(1, VirtualAddress::new(0x4000_0000)).is_ok());
    }

    #[test]
    fn fault_outside_any_region_is_rejected() {
        let (frames, vmm) = setup();
        let info = PageFaultInfo {
            address: VirtualAddress::new(0x6000_0000),
            code: PageFaultCode::USER,
            pid: 1,
            rip: 0,
        };
        assert!(matches!(
            handle_page_fault(&frames, &vmm, &info),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn write_to_read_only_region_is_not_permitted() {
        let (frames, vmm) = setup();
        vmm.with_space(1, |s| {
            s.add_region(MemoryRegion::new(
                VirtualAddress::new(0x4000_0000),
                VirtualAddress::new(0x4000_1000),
                Protection::READ,
                "ro",
            ))
        })
        .unwrap();

        let info = PageFaultInfo {
            address: VirtualAddress::new(0x4000_0000),
            code: PageFaultCode::USER | PageFaultCode::WRITE,
            pid: 1,
            rip: 0,
        };
        assert!(matches!(
            handle_page_fault(&frames, &vmm, &info),
            Err(KernelError::NotPermitted { .. })
        ));
    }

    #[test]
    fn reserved_bit_fault_is_fatal() {
        let (frames, vmm) = setup();
        let info = PageFaultInfo {
            address: VirtualAddress::new(0x4000_0000),
            code: PageFaultCode::PRESENT | PageFaultCode::RESERVED_BIT,
            pid: 1,
            rip: 0,
        };
        let err = handle_page_fault(&frames, &vmm, &info).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn cow_write_fault_resolves_via_vmm() {
        let (frames, vmm) = setup();
        add_rw_region(&vmm, 0x4000_0000, 0x4000_1000);

        // Back the page, then mark it COW to simulate a shared mapping.
        let virt = VirtualAddress::new(0x4000_0000);
        let phys = frames.allocate().unwrap().as_addr();
        vmm.map(
            &frames,
            1,
            virt,
            phys,
            (Protection::READ | Protection::WRITE).to_page_flags(),
        )
        .unwrap();
        vmm.copy_on_write_mark(1, virt).unwrap();

        let info = PageFaultInfo {
            address: virt,
            code: PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER,
            pid: 1,
            rip: 0,
        };
        let resolution = handle_page_fault(&frames, &vmm, &info).unwrap();
        assert_eq!(
            resolution,
            FaultResolution::Cow(CowResolution::MadeWritable)
        );
    }

    #[test]
    fn second_read_after_demand_zero_hits_the_same_frame() {
        let (frames, vmm) = setup();
        add_rw_region(&vmm, 0x4000_0000, 0x4000_1000);

        let info = PageFaultInfo {
            address: VirtualAddress::new(0x4000_0ABC),
            code: PageFaultCode::USER,
            pid: 1,
            rip: 0,
        };
        handle_page_fault(&frames, &vmm, &info).unwrap();
        let first = vmm.translate(1, VirtualAddress::new(0x4000_0000)).unwrap();
        let again = vmm.translate(1, VirtualAddress::new(0x4000_0000)).unwrap();
        assert_eq!(first, again);
    }
}
