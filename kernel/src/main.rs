//! Helios kernel binary entry point.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare_metal {
    use core::panic::PanicInfo;

    use helios_kernel::{
        arch,
        boot::{BootInfo, RawBootInfo},
        bootstrap,
    };

    /// Kernel entry. The boot stub passes a [`RawBootInfo`] pointer in
    /// RDI (the first C ABI argument); a null pointer selects the default
    /// machine description.
    #[no_mangle]
    pub extern "C" fn _start(boot_info: *const RawBootInfo) -> ! {
        if boot_info.is_null() {
            let fallback = BootInfo::fallback();
            bootstrap::kernel_main(&fallback)
        } else {
            // SAFETY: The boot stub guarantees the record and everything
            // it points to stays mapped and unmodified.
            let decoded = unsafe { (*boot_info).decode() };
            bootstrap::kernel_main(&decoded)
        }
    }

    /// Fatal errors end here: interrupts off, reason on the console, halt.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        arch::x86_64::hal::cli();
        helios_kernel::println!("\nKERNEL PANIC: {}", info);
        arch::x86_64::serial::write_str_raw("KERNEL PANIC\n");
        arch::halt_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only runs on bare metal; the host build exists for the
    // test suite in the library crate.
    eprintln!("helios-kernel must be built for x86_64-unknown-none");
}
