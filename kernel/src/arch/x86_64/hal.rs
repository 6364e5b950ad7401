//! Hardware abstraction leaf.
//!
//! The narrow interface the rest of the kernel uses for privileged
//! instructions: port-mapped I/O, the interrupt flag, halt, descriptor
//! table loads, control registers, TLB invalidation, the TSC, and CPUID.
//! Everything here is a thin wrapper over the `x86_64` crate (or
//! `core::arch` where the crate has no wrapper); no policy lives at this
//! layer.

#![allow(dead_code)]

use x86_64::{
    instructions::{self, interrupts, port::Port, tlb},
    registers::control::{Cr0, Cr2, Cr3, Cr3Flags},
    structures::paging::PhysFrame,
    PhysAddr, VirtAddr,
};

// ---------------------------------------------------------------------------
// Port-mapped I/O
// ---------------------------------------------------------------------------

/// Write a byte to an I/O port.
///
/// # Safety
///
/// Port writes have device-defined side effects; the caller must know the
/// port and value are valid for the device being driven.
pub unsafe fn outb(port: u16, value: u8) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { Port::new(port).write(value) }
}

/// Write a 16-bit word to an I/O port.
///
/// # Safety
///
/// Same contract as [`outb`].
pub unsafe fn outw(port: u16, value: u16) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { Port::new(port).write(value) }
}

/// Write a 32-bit word to an I/O port.
///
/// # Safety
///
/// Same contract as [`outb`].
pub unsafe fn outl(port: u16, value: u32) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { Port::new(port).write(value) }
}

/// Read a byte from an I/O port.
///
/// # Safety
///
/// Port reads can have side effects (e.g. the PS/2 data port pops the
/// scancode queue); the caller must expect them.
pub unsafe fn inb(port: u16) -> u8 {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { Port::new(port).read() }
}

/// Read a 16-bit word from an I/O port.
///
/// # Safety
///
/// Same contract as [`inb`].
pub unsafe fn inw(port: u16) -> u16 {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { Port::new(port).read() }
}

/// Read a 32-bit word from an I/O port.
///
/// # Safety
///
/// Same contract as [`inb`].
pub unsafe fn inl(port: u16) -> u32 {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { Port::new(port).read() }
}

// ---------------------------------------------------------------------------
// Interrupt flag and halt
// ---------------------------------------------------------------------------

/// Clear the interrupt flag (disable maskable interrupts).
pub fn cli() {
    interrupts::disable();
}

/// Set the interrupt flag (enable maskable interrupts).
pub fn sti() {
    interrupts::enable();
}

/// Whether maskable interrupts are currently enabled.
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

/// Run a closure with interrupts disabled, restoring the previous state.
/// This is the only short-term mutual-exclusion primitive available to
/// code shared with IRQ handlers.
pub fn without_interrupts<F: FnOnce() -> R, R>(f: F) -> R {
    interrupts::without_interrupts(f)
}

/// Halt until the next interrupt.
pub fn hlt() {
    instructions::hlt();
}

// ---------------------------------------------------------------------------
// Descriptor tables
// ---------------------------------------------------------------------------

/// Packed 10-byte descriptor-table pointer (2-byte limit, 8-byte base),
/// re-exported so callers do not reach into the `x86_64` crate directly.
pub type DescriptorTablePointer = x86_64::structures::DescriptorTablePointer;

/// Load the IDT register.
///
/// # Safety
///
/// `ptr` must describe a valid IDT that stays alive and immovable for as
/// long as it is installed.
pub unsafe fn load_idt(ptr: &DescriptorTablePointer) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { x86_64::instructions::tables::lidt(ptr) }
}

/// Load the GDT register.
///
/// # Safety
///
/// `ptr` must describe a valid GDT that stays alive and immovable for as
/// long as it is installed.
pub unsafe fn load_gdt(ptr: &DescriptorTablePointer) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { x86_64::instructions::tables::lgdt(ptr) }
}

// ---------------------------------------------------------------------------
// Control registers and TLB
// ---------------------------------------------------------------------------

/// Read CR0.
pub fn read_cr0() -> u64 {
    Cr0::read_raw()
}

/// Write CR0.
///
/// # Safety
///
/// CR0 controls protected mode, paging, and caching; an invalid value
/// takes down the machine.
pub unsafe fn write_cr0(value: u64) {
    // SAFETY: Forwarded to the caller's contract.
    unsafe { Cr0::write_raw(value) }
}

/// Read CR2 (the faulting address during a page fault).
pub fn read_cr2() -> u64 {
    Cr2::read_raw()
}

/// Read CR3 (the physical address of the active L4 page table).
pub fn read_cr3() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

/// Install a new page-table root. Implies a full TLB flush for non-global
/// entries.
///
/// # Safety
///
/// `root` must be the physical address of a valid, 4 KiB-aligned L4 table
/// whose kernel half covers the currently executing code.
pub unsafe fn write_cr3(root: u64) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root));
    // SAFETY: Forwarded to the caller's contract.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) }
}

/// Invalidate the TLB entry covering one virtual address.
pub fn invlpg(virt: u64) {
    tlb::flush(VirtAddr::new(virt));
}

/// Flush the entire TLB (reload CR3).
pub fn flush_tlb_all() {
    tlb::flush_all();
}

// ---------------------------------------------------------------------------
// TSC and CPUID
// ---------------------------------------------------------------------------

/// Read the time-stamp counter.
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: RDTSC has no memory effects and is unprivileged unless
    // CR4.TSD is set, which this kernel never sets.
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    0
}

/// Execute CPUID for the given leaf, returning (eax, ebx, ecx, edx).
pub fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: CPUID is unprivileged and has no side effects beyond the
        // returned registers.
        let r = unsafe { core::arch::x86_64::__cpuid(leaf) };
        (r.eax, r.ebx, r.ecx, r.edx)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = leaf;
        (0, 0, 0, 0)
    }
}
