//! x86-64 architecture support: HAL leaf, GDT/TSS, VGA text console,
//! serial port, and the saved CPU context used for context switching.

pub mod context;
pub mod gdt;
#[cfg(target_arch = "x86_64")]
pub mod hal;
pub mod serial;
pub mod vga;
