//! Helios Kernel Library
//!
//! Core functionality for the Helios kernel: physical and virtual memory
//! management, the hybrid RT+CFS scheduler, interrupt and syscall dispatch,
//! the in-memory VFS, and the legacy PC device drivers.
//!
//! The crate builds for `x86_64-unknown-none` (the real kernel) and for the
//! host, where the hardware-free core is exercised by the standard `#[test]`
//! harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// On bare-metal targets use the kernel heap allocator. On the host
// (x86_64-unknown-linux-gnu) for testing, delegate to the system allocator
// so that test code using Vec/String/alloc compiles and runs.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global heap allocator.
#[cfg(target_os = "none")]
pub fn get_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod bootstrap;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod interrupts;
pub mod kernel;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod timer;

#[cfg(test)]
mod integration_tests;

// Re-export the items tests and the boot path reach for most often.
pub use boot::BootInfo;
pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;
pub use mm::{FrameNumber, PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use process::{Pid, Priority, ProcessState, SchedPolicy};

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
