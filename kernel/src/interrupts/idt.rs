//! Interrupt Descriptor Table and handler stubs (bare metal only).
//!
//! Exception handlers use the `x86-interrupt` ABI. The timer IRQ and the
//! syscall gate instead enter through hand-written stubs that capture the
//! full register file as an [`InterruptContext`](super::InterruptContext),
//! because both paths can context-switch.

#![cfg(all(target_arch = "x86_64", target_os = "none"))]

use lazy_static::lazy_static;
use x86_64::{
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
    PrivilegeLevel, VirtAddr,
};

use super::{InterruptContext, VECTOR_SYSCALL, VECTOR_TIMER};
use crate::{
    arch::x86_64::{gdt, hal},
    drivers::pic,
    mm::{page_fault::PageFaultCode, VirtualAddress},
};

core::arch::global_asm!(
    r#"
    .global timer_entry
    timer_entry:
        push 0
        push 0x20
        push rax
        push rbx
        push rcx
        push rdx
        push rsi
        push rdi
        push rbp
        push r8
        push r9
        push r10
        push r11
        push r12
        push r13
        push r14
        push r15
        mov rdi, rsp
        call timer_trampoline
        pop r15
        pop r14
        pop r13
        pop r12
        pop r11
        pop r10
        pop r9
        pop r8
        pop rbp
        pop rdi
        pop rsi
        pop rdx
        pop rcx
        pop rbx
        pop rax
        add rsp, 16
        iretq

    .global syscall_entry
    syscall_entry:
        push 0
        push 0x80
        push rax
        push rbx
        push rcx
        push rdx
        push rsi
        push rdi
        push rbp
        push r8
        push r9
        push r10
        push r11
        push r12
        push r13
        push r14
        push r15
        mov rdi, rsp
        call syscall_trampoline
        pop r15
        pop r14
        pop r13
        pop r12
        pop r11
        pop r10
        pop r9
        pop r8
        pop rbp
        pop rdi
        pop rsi
        pop rdx
        pop rcx
        pop rbx
        pop rax
        add rsp, 16
        iretq
    "#
);

extern "C" {
    fn timer_entry();
    fn syscall_entry();
}

/// Timer IRQ body: advance the clock, run the scheduler, apply any
/// context switch to the saved frame, then EOI before returning.
#[no_mangle]
extern "C" fn timer_trampoline(ctx: *mut InterruptContext) {
    // SAFETY: The stub passes a pointer to the frame it just pushed on
    // this kernel stack; it stays valid until the stub pops it.
    let ctx = unsafe { &mut *ctx };
    if let Some(kernel) = crate::kernel::try_kernel() {
        kernel.on_timer_tick(ctx);
    } else {
        crate::timer::on_tick();
    }
    pic::send_eoi(0);
}

/// Syscall gate body: dispatch from the saved frame; the return value is
/// written into the frame's rax.
#[no_mangle]
extern "C" fn syscall_trampoline(ctx: *mut InterruptContext) {
    // SAFETY: Same stub contract as timer_trampoline.
    let ctx = unsafe { &mut *ctx };
    if let Some(kernel) = crate::kernel::try_kernel() {
        crate::syscall::dispatch(kernel, ctx);
    } else {
        ctx.set_return_value(u64::MAX);
    }
}

/// Generates `extern "x86-interrupt"` handlers for IRQ vectors that only
/// need an EOI (no kernel-side consumer yet).
macro_rules! spurious_irq_handler {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            pic::send_eoi($irq);
        }
    };
}

spurious_irq_handler!(irq2_handler, 2);
spurious_irq_handler!(irq3_handler, 3);
spurious_irq_handler!(irq4_handler, 4);
spurious_irq_handler!(irq5_handler, 5);
spurious_irq_handler!(irq6_handler, 6);
spurious_irq_handler!(irq7_handler, 7);
spurious_irq_handler!(irq8_handler, 8);
spurious_irq_handler!(irq9_handler, 9);
spurious_irq_handler!(irq10_handler, 10);
spurious_irq_handler!(irq11_handler, 11);
spurious_irq_handler!(irq12_handler, 12);
spurious_irq_handler!(irq13_handler, 13);
spurious_irq_handler!(irq14_handler, 14);
spurious_irq_handler!(irq15_handler, 15);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // CPU exceptions.
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        // SAFETY: DOUBLE_FAULT_IST_INDEX refers to a stack installed in
        // the TSS by gdt::init before the IDT is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }

        // Timer IRQ enters through the context-capturing stub.
        // SAFETY: timer_entry is a stub with the correct IDT calling
        // discipline (it ends in iretq and preserves all registers).
        unsafe {
            idt[VECTOR_TIMER]
                .set_handler_addr(VirtAddr::new(timer_entry as usize as u64));
        }

        // Keyboard IRQ.
        idt[super::VECTOR_KEYBOARD].set_handler_fn(keyboard_interrupt_handler);

        // Remaining PIC lines get EOI-only handlers.
        idt[34].set_handler_fn(irq2_handler);
        idt[35].set_handler_fn(irq3_handler);
        idt[36].set_handler_fn(irq4_handler);
        idt[37].set_handler_fn(irq5_handler);
        idt[38].set_handler_fn(irq6_handler);
        idt[39].set_handler_fn(irq7_handler);
        idt[40].set_handler_fn(irq8_handler);
        idt[41].set_handler_fn(irq9_handler);
        idt[42].set_handler_fn(irq10_handler);
        idt[43].set_handler_fn(irq11_handler);
        idt[44].set_handler_fn(irq12_handler);
        idt[45].set_handler_fn(irq13_handler);
        idt[46].set_handler_fn(irq14_handler);
        idt[47].set_handler_fn(irq15_handler);

        // Syscall gate: user-callable.
        // SAFETY: syscall_entry follows the same stub discipline as
        // timer_entry.
        unsafe {
            idt[VECTOR_SYSCALL]
                .set_handler_addr(VirtAddr::new(syscall_entry as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }

        idt
    };
}

/// Build and load the IDT. Called once from `arch::init`.
pub fn init() {
    IDT.load();
    log::info!("interrupts: IDT loaded ({} gates)", super::IDT_ENTRIES);
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("divide error", &stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    fatal_exception("invalid opcode", &stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("double fault\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    log::error!(
        "general protection fault, code {:#x} at {:#x}",
        error_code,
        stack_frame.instruction_pointer.as_u64()
    );
    fatal_exception("general protection fault", &stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let address = VirtualAddress::new(hal::read_cr2());
    let code = PageFaultCode::from_bits_truncate(error_code.bits());
    let rip = stack_frame.instruction_pointer.as_u64();

    let Some(kernel) = crate::kernel::try_kernel() else {
        panic!(
            "early page fault at {:#x} (rip {:#x}, code {:?})",
            address.as_u64(),
            rip,
            code
        );
    };

    match kernel.handle_page_fault(address, code, rip) {
        Ok(_) => {} // resolved; iretq retries the access
        Err(err) if err.is_fatal() => {
            panic!("unrecoverable page fault: {}", err);
        }
        Err(err) => {
            let from_user = stack_frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3;
            if !from_user {
                panic!(
                    "kernel page fault at {:#x} (rip {:#x}): {}",
                    address.as_u64(),
                    rip,
                    err
                );
            }
            // The faulting process is terminated; park this stack until
            // the next timer tick switches away for good.
            kernel.kill_current_for_fault(err);
            hal::sti();
            loop {
                hal::hlt();
            }
        }
    }
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    // SAFETY: Reading the PS/2 data port pops the controller's output
    // queue, which is exactly what the IRQ signals.
    let scancode = unsafe { hal::inb(crate::drivers::keyboard::DATA_PORT) };
    crate::drivers::keyboard::handle_scancode(scancode);
    pic::send_eoi(1);
}

fn fatal_exception(what: &'static str, stack_frame: &InterruptStackFrame) {
    let from_user = stack_frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3;
    if !from_user {
        panic!("{} in kernel at {:#x}", what, stack_frame.instruction_pointer.as_u64());
    }
    if let Some(kernel) = crate::kernel::try_kernel() {
        kernel.kill_current_for_fault(crate::error::KernelError::NotPermitted {
            operation: what,
        });
        hal::sti();
        loop {
            hal::hlt();
        }
    }
    panic!("{} before kernel init", what);
}
