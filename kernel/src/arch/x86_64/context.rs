//! Saved CPU context for context switching.
//!
//! A context switch on Helios happens on the interrupt path: the entry stub
//! for preemption-capable vectors saves the full register file into an
//! [`InterruptContext`](crate::interrupts::InterruptContext) on the kernel
//! stack, the scheduler copies it into the outgoing process's `CpuContext`
//! and overwrites it from the incoming one, and the stub's `iretq` restores
//! the new process's state. If the page-table root differs, CR3 is switched
//! (which implicitly flushes the non-global TLB).

use crate::interrupts::InterruptContext;

use super::gdt;

/// Full saved CPU state for one process.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct CpuContext {
    /// General purpose registers
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    /// Stack pointer
    pub rsp: u64,
    /// Instruction pointer
    pub rip: u64,
    /// CPU flags
    pub rflags: u64,

    /// Segment selectors
    pub cs: u16,
    pub ss: u16,

    /// Page table base installed when this context runs.
    pub cr3: u64,
}

/// RFLAGS with only the always-one bit set (interrupts disabled).
pub const RFLAGS_BASE: u64 = 0x002;
/// RFLAGS with the interrupt flag set.
pub const RFLAGS_IF: u64 = 0x202;

impl CpuContext {
    /// Context for a kernel-mode thread starting at `entry`.
    pub fn new_kernel(entry: u64, stack_top: u64, cr3: u64) -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rsp: stack_top,
            rip: entry,
            rflags: RFLAGS_IF,
            cs: gdt::KERNEL_CODE_SELECTOR,
            ss: gdt::KERNEL_DATA_SELECTOR,
            cr3,
        }
    }

    /// Context for a user-mode process: ring 3 selectors, interrupts
    /// enabled, registers cleared.
    pub fn new_user(entry: u64, stack_top: u64, cr3: u64) -> Self {
        Self {
            cs: gdt::USER_CODE_SELECTOR,
            ss: gdt::USER_DATA_SELECTOR,
            ..Self::new_kernel(entry, stack_top, cr3)
        }
    }

    /// Capture the register file from a saved interrupt frame (the outgoing
    /// side of a context switch). CR3 keeps its stored value; the interrupt
    /// path never changes address spaces on its own.
    pub fn save_from(&mut self, frame: &InterruptContext) {
        self.r15 = frame.r15;
        self.r14 = frame.r14;
        self.r13 = frame.r13;
        self.r12 = frame.r12;
        self.r11 = frame.r11;
        self.r10 = frame.r10;
        self.r9 = frame.r9;
        self.r8 = frame.r8;
        self.rbp = frame.rbp;
        self.rdi = frame.rdi;
        self.rsi = frame.rsi;
        self.rdx = frame.rdx;
        self.rcx = frame.rcx;
        self.rbx = frame.rbx;
        self.rax = frame.rax;
        self.rsp = frame.rsp;
        self.rip = frame.rip;
        self.rflags = frame.rflags;
        self.cs = frame.cs as u16;
        self.ss = frame.ss as u16;
    }

    /// Write this context into an interrupt frame (the incoming side of a
    /// context switch); the stub's `iretq` then resumes the process.
    pub fn restore_into(&self, frame: &mut InterruptContext) {
        frame.r15 = self.r15;
        frame.r14 = self.r14;
        frame.r13 = self.r13;
        frame.r12 = self.r12;
        frame.r11 = self.r11;
        frame.r10 = self.r10;
        frame.r9 = self.r9;
        frame.r8 = self.r8;
        frame.rbp = self.rbp;
        frame.rdi = self.rdi;
        frame.rsi = self.rsi;
        frame.rdx = self.rdx;
        frame.rcx = self.rcx;
        frame.rbx = self.rbx;
        frame.rax = self.rax;
        frame.rsp = self.rsp;
        frame.rip = self.rip;
        frame.rflags = self.rflags;
        frame.cs = self.cs as u64;
        frame.ss = self.ss as u64;
    }
}

/// Jump into a freshly created context for the first time by building an
/// `iretq` frame by hand. General-purpose registers of a new process start
/// zeroed, so only the frame matters here.
///
/// # Safety
///
/// `ctx` must describe a valid entry point and mapped stack in the address
/// space selected by `ctx.cr3`, and `ctx.cr3` must be a valid page-table
/// root whose kernel half maps the currently executing code.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn enter_first(ctx: &CpuContext) -> ! {
    // SAFETY: Per the function contract; CR3 is switched before the frame
    // is pushed so the iretq lands in the target address space.
    unsafe {
        super::hal::write_cr3(ctx.cr3);
        core::arch::asm!(
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor ebp, ebp",
            "iretq",
            ss = in(reg) ctx.ss as u64,
            rsp = in(reg) ctx.rsp,
            rflags = in(reg) ctx.rflags,
            cs = in(reg) ctx.cs as u64,
            rip = in(reg) ctx.rip,
            options(noreturn),
        )
    }
}
