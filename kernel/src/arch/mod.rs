//! Architecture support.
//!
//! Helios targets x86-64 only; this module exists to keep the
//! architecture-specific surface (HAL, GDT, IDT glue, VGA, serial) in one
//! place behind a stable path.

pub mod x86_64;

/// Initialize architecture state: GDT/TSS first, then the IDT.
#[cfg(target_os = "none")]
pub fn init() {
    x86_64::gdt::init();
    crate::interrupts::idt::init();
}

/// Halt the CPU forever, interrupts disabled. Used by the panic path.
#[cfg(target_os = "none")]
pub fn halt_loop() -> ! {
    x86_64::hal::cli();
    loop {
        x86_64::hal::hlt();
    }
}
