//! Boot sequencer.
//!
//! Brings the subsystems up in dependency order, leaves first: heap, then
//! GDT/IDT, then the kernel root (frame allocator, VMM, page-fault wiring,
//! processes, scheduler, VFS, syscall table all hang off it), then the
//! hardware drivers, and finally interrupts on and the idle loop.

use crate::{
    boot::BootInfo,
    sched::BALANCE_INTERVAL_MS,
    timer::{self, TimerId, TimerMode},
};

/// Software-timer callback driving the periodic load balancer.
fn balance_tick(_id: TimerId) {
    if let Some(kernel) = crate::kernel::try_kernel() {
        kernel.balance();
    }
}

/// Register the periodic kernel timers. Split out so the host test suite
/// can exercise it without booting.
pub fn register_periodic_tasks() -> crate::error::KernelResult<()> {
    timer::create_timer(TimerMode::Periodic, BALANCE_INTERVAL_MS, balance_tick)?;
    Ok(())
}

/// Full bring-up on bare metal. Never returns; ends in the idle loop.
#[cfg(target_os = "none")]
pub fn kernel_main(boot: &BootInfo) -> ! {
    use crate::{
        arch,
        boot::KernelConfig,
        drivers,
        kernel::{install, Kernel},
        logger, mm,
    };

    // Stage 1: memory for the kernel itself, then the console is usable.
    mm::heap::init();
    println!("Helios {} booting...", env!("CARGO_PKG_VERSION"));

    let config = KernelConfig::parse(boot.cmdline);
    logger::init(config.log_level);
    log::info!("boot: command line {:?}", boot.cmdline);

    // Stage 2: CPU tables (GDT/TSS, IDT with the syscall gate).
    arch::init();

    // Stage 3: the kernel root -- frame pool, VMM, process table,
    // scheduler, VFS.
    let kernel = match Kernel::new(boot) {
        Ok(kernel) => kernel,
        Err(e) => panic!("kernel construction failed: {}", e),
    };
    let info = kernel.memory_info();
    log::info!(
        "boot: memory {} KiB total, {} KiB free",
        info.total / 1024,
        info.free / 1024
    );

    let kernel = match install(kernel) {
        Ok(kernel) => kernel,
        Err(e) => panic!("kernel install failed: {}", e),
    };

    // Stage 4: hardware drivers (PIC remap, PIT at 100 Hz, keyboard,
    // console).
    if let Err(e) = drivers::register_builtin(&kernel.devices) {
        panic!("driver bring-up failed: {}", e);
    }

    // Stage 5: periodic kernel work and the timer interrupt.
    if let Err(e) = register_periodic_tasks() {
        log::warn!("boot: periodic tasks unavailable: {}", e);
    }

    log::info!(
        "boot: {} drivers, {} inodes, ready",
        kernel.devices.len(),
        kernel.vfs.inode_count()
    );
    println!("helios: boot complete");

    // Stage 6: interrupts on; the PIT tick now drives scheduling.
    arch::x86_64::hal::sti();
    loop {
        arch::x86_64::hal::hlt();
    }
}

// Keep the signature documented for the host build too.
#[cfg(not(target_os = "none"))]
pub fn kernel_main(_boot: &BootInfo) {
    unreachable!("kernel_main is only meaningful on bare metal");
}
