//! Interrupt and trap plumbing.
//!
//! Vector layout: CPU exceptions occupy 0-31, the remapped PIC IRQs sit at
//! 32-47, and the syscall gate is 0x80 (user-callable, DPL 3). Entry stubs
//! for preemption-capable vectors (the timer IRQ and the syscall gate)
//! save the full register file into an [`InterruptContext`]; the scheduler
//! edits that frame to effect a context switch and the stub's `iretq`
//! resumes whichever process the frame now describes.

pub mod idt;

/// First vector of the remapped master PIC (IRQ 0).
pub const IRQ_BASE: u8 = 0x20;

/// First vector of the remapped slave PIC (IRQ 8).
pub const IRQ_SLAVE_BASE: u8 = 0x28;

/// Timer interrupt vector (IRQ 0).
pub const VECTOR_TIMER: u8 = IRQ_BASE;

/// Keyboard interrupt vector (IRQ 1).
pub const VECTOR_KEYBOARD: u8 = IRQ_BASE + 1;

/// Software-interrupt vector of the syscall gate.
pub const VECTOR_SYSCALL: u8 = 0x80;

/// Number of IDT entries.
pub const IDT_ENTRIES: usize = 256;

/// Saved CPU state on the kernel stack during an interrupt.
///
/// Field order mirrors the entry stub's push sequence exactly (lowest
/// address first); the layout is part of the stub ABI.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct InterruptContext {
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
    /// Interrupt vector number, pushed by the stub.
    pub vector: u64,
    /// Error code (zero for vectors without one).
    pub error_code: u64,
    // Hardware-pushed frame.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptContext {
    /// An all-zero frame, for building fresh contexts in tests and at
    /// process creation.
    pub fn zeroed() -> Self {
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
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// Syscall number, taken from rax.
    pub fn syscall_number(&self) -> u64 {
        self.rax
    }

    /// Up to six syscall arguments: rdi, rsi, rdx, r10, r8, r9.
    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    /// Write the syscall return value back to rax.
    pub fn set_return_value(&mut self, value: u64) {
        self.rax = value;
    }

    /// Whether the interrupted code was running in user mode (RPL 3).
    pub fn from_user_mode(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn syscall_register_convention() {
        let mut ctx = InterruptContext::zeroed();
        ctx.rax = 1;
        ctx.rdi = 10;
        ctx.rsi = 20;
        ctx.rdx = 30;
        ctx.r10 = 40;
        ctx.r8 = 50;
        ctx.r9 = 60;

        assert_eq!(ctx.syscall_number(), 1);
        assert_eq!(ctx.syscall_args(), [10, 20, 30, 40, 50, 60]);

        ctx.set_return_value(u64::MAX);
        assert_eq!(ctx.rax, u64::MAX);
    }

    #[test]
    fn user_mode_detection_uses_rpl() {
        let mut ctx = InterruptContext::zeroed();
        ctx.cs = 0x08; // kernel code selector
        assert!(!ctx.from_user_mode());
        ctx.cs = 0x33; // user code selector, RPL 3
        assert!(ctx.from_user_mode());
    }

    #[test]
    fn vector_layout_matches_pic_remap() {
        assert_eq!(VECTOR_TIMER, 32);
        assert_eq!(VECTOR_KEYBOARD, 33);
        assert_eq!(IRQ_SLAVE_BASE, 40);
        assert_eq!(VECTOR_SYSCALL, 0x80);
    }
}
