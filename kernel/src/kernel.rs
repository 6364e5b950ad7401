//! The kernel root.
//!
//! All subsystem state hangs off one [`Kernel`] value constructed by the
//! boot sequencer. Interrupt handlers, which cannot take parameters, reach
//! it through a statically-placed once-cell initialized during boot and
//! never mutated afterwards.
//!
//! Locking discipline: `procs` before `sched`; the frame allocator and
//! the VMM's internal locks are innermost. Every path that takes these
//! locks runs either during single-threaded boot or in interrupt context
//! with the interrupt flag clear (interrupt gates clear IF on entry), so
//! an IRQ can never spin on a lock held by the code it preempted.

use crate::{
    arch::x86_64::context::CpuContext,
    boot::{BootInfo, KernelConfig},
    drivers::DeviceManager,
    error::{KernelError, KernelResult},
    fs::Vfs,
    interrupts::InterruptContext,
    mm::{
        page_fault::{self, FaultResolution, PageFaultCode, PageFaultInfo},
        FrameAllocator, MemoryInfo, PhysicalAddress, VirtualAddress, Vmm,
    },
    process::{Pid, Priority, ProcessTable, SchedPolicy, KERNEL_PID},
    sched::{load_balance, scheduler::Switch, Scheduler},
    sync::OnceLock,
    timer,
};

use spin::Mutex;

/// The kernel root value.
pub struct Kernel {
    pub config: KernelConfig,
    pub frames: FrameAllocator,
    pub vmm: Vmm,
    pub procs: Mutex<ProcessTable>,
    pub sched: Mutex<Scheduler>,
    pub vfs: Vfs,
    pub devices: DeviceManager,
}

static KERNEL: OnceLock<Kernel> = OnceLock::new();

/// The installed kernel root. Panics before [`install`] has run; interrupt
/// plumbing uses [`try_kernel`] instead.
pub fn kernel() -> &'static Kernel {
    try_kernel().expect("kernel root not installed")
}

/// The installed kernel root, if boot has progressed that far.
pub fn try_kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}

/// Publish the kernel root for interrupt handlers. Once.
pub fn install(kernel: Kernel) -> KernelResult<&'static Kernel> {
    KERNEL
        .set(kernel)
        .map_err(|_| KernelError::AlreadyExists {
            resource: "kernel root",
        })?;
    Ok(KERNEL.get().expect("installed on the line above"))
}

impl Kernel {
    /// Build every subsystem from the boot handoff: frame pool from the
    /// memory map, kernel-half mappings, the PID-0 kernel thread, the
    /// scheduler, and the VFS skeleton. Driver registration stays with the
    /// boot sequencer because it touches hardware.
    pub fn new(boot: &BootInfo) -> KernelResult<Self> {
        let config = KernelConfig::parse(boot.cmdline);

        let frames = FrameAllocator::new();
        for entry in boot.memory_map {
            frames.add_region(
                PhysicalAddress::new(entry.base),
                entry.length,
                entry.region_type(),
            );
        }
        if frames.total_frames() == 0 {
            return Err(KernelError::OutOfMemory { requested: 0 });
        }

        let vmm = Vmm::new();
        vmm.init_kernel_space(&frames)?;

        let mut procs = ProcessTable::new();
        procs.insert_kernel_process();

        let mut sched = Scheduler::new(1);
        sched.adopt_running(&mut procs, 0, KERNEL_PID);

        let vfs = Vfs::new();
        vfs.init_skeleton()?;

        Ok(Self {
            config,
            frames,
            vmm,
            procs: Mutex::new(procs),
            sched: Mutex::new(sched),
            vfs,
            devices: DeviceManager::new(),
        })
    }

    // -- process lifecycle --------------------------------------------------

    /// Create a process and hand it to the scheduler.
    pub fn spawn(
        &self,
        name: &str,
        entry: VirtualAddress,
        stack_size: usize,
    ) -> KernelResult<Pid> {
        self.spawn_with_policy(name, entry, stack_size, self.config.default_policy, Priority::Normal)
    }

    /// Create a process with an explicit policy and priority.
    pub fn spawn_with_policy(
        &self,
        name: &str,
        entry: VirtualAddress,
        stack_size: usize,
        policy: SchedPolicy,
        priority: Priority,
    ) -> KernelResult<Pid> {
        let mut procs = self.procs.lock();
        let mut sched = self.sched.lock();
        let parent = sched.current(0).unwrap_or(KERNEL_PID);
        let pid = procs.create(
            &self.frames,
            &self.vmm,
            name,
            entry,
            stack_size,
            policy,
            priority,
            parent,
        )?;

        // Wire fds 0/1/2 (stdin, stdout, stderr) to the console device.
        for fd in 0..3u32 {
            if let Ok(open_id) = self
                .vfs
                .open("/dev/console", crate::fs::OpenFlags::read_write())
            {
                if let Some(p) = procs.get_mut(pid) {
                    p.fds.insert(fd, open_id);
                }
            }
        }

        sched.enqueue(&mut procs, pid)?;
        Ok(pid)
    }

    /// Kill a process by PID. PID 0 is unkillable.
    pub fn kill(&self, pid: Pid) -> KernelResult<()> {
        if pid == KERNEL_PID {
            return Err(KernelError::NotPermitted {
                operation: "kill PID 0",
            });
        }
        let mut procs = self.procs.lock();
        let mut sched = self.sched.lock();
        self.close_process_fds(&mut procs, pid);
        sched.remove(&mut procs, pid);
        procs.terminate(&self.frames, &self.vmm, pid, -1)
    }

    /// Exit the process currently running on `cpu` and pick a successor.
    pub fn exit_current(&self, cpu: usize, code: i64) -> Switch {
        let mut procs = self.procs.lock();
        let mut sched = self.sched.lock();
        if let Some(pid) = sched.current(cpu) {
            if pid != KERNEL_PID {
                self.close_process_fds(&mut procs, pid);
                sched.remove(&mut procs, pid);
                let _ = procs.terminate(&self.frames, &self.vmm, pid, code);
            }
        }
        sched.schedule(&mut procs, cpu)
    }

    fn close_process_fds(&self, procs: &mut ProcessTable, pid: Pid) {
        if let Some(p) = procs.get_mut(pid) {
            let open_ids: alloc::vec::Vec<u64> = p.fds.values().copied().collect();
            p.fds.clear();
            for id in open_ids {
                let _ = self.vfs.close(id);
            }
        }
    }

    /// The PID currently running on `cpu`.
    pub fn current_pid(&self, cpu: usize) -> Pid {
        self.sched.lock().current(cpu).unwrap_or(KERNEL_PID)
    }

    // -- interrupt-driven paths ---------------------------------------------

    /// Timer IRQ body: advance the clock, run the scheduler, and apply any
    /// resulting context switch to the saved interrupt frame.
    pub fn on_timer_tick(&self, ctx: &mut InterruptContext) {
        let now = timer::on_tick();
        let mut procs = self.procs.lock();
        let mut sched = self.sched.lock();
        let switch = sched.tick(&mut procs, 0, now);
        drop(sched);
        self.apply_switch(&mut procs, switch, ctx);
    }

    /// Copy the outgoing process's registers out of the interrupt frame
    /// and the incoming process's registers into it. CR3 follows when it
    /// differs.
    pub fn apply_switch(
        &self,
        procs: &mut ProcessTable,
        switch: Switch,
        ctx: &mut InterruptContext,
    ) {
        if !switch.changed() {
            return;
        }
        if let Some(prev) = switch.prev {
            if let Some(p) = procs.get_mut(prev) {
                p.context.save_from(ctx);
            }
        }
        if let Some(next) = switch.next {
            if let Some(p) = procs.get(next) {
                let incoming: CpuContext = p.context.clone();
                incoming.restore_into(ctx);
                #[cfg(target_os = "none")]
                {
                    if incoming.cr3 != 0
                        && incoming.cr3 != crate::arch::x86_64::hal::read_cr3()
                    {
                        // SAFETY: cr3 was recorded from a live address-space
                        // root whose kernel half mirrors the master.
                        unsafe {
                            crate::arch::x86_64::hal::write_cr3(incoming.cr3);
                        }
                    }
                }
            }
        }
    }

    /// Page-fault entry: classify, resolve, and account. Errors bubble to
    /// the trap handler, which kills the process or panics.
    pub fn handle_page_fault(
        &self,
        address: VirtualAddress,
        code: PageFaultCode,
        rip: u64,
    ) -> KernelResult<FaultResolution> {
        let pid = self.current_pid(0);
        let info = PageFaultInfo {
            address,
            code,
            pid,
            rip,
        };
        let resolution = page_fault::handle_page_fault(&self.frames, &self.vmm, &info)?;

        let mut procs = self.procs.lock();
        if let Some(p) = procs.get_mut(pid) {
            match resolution {
                FaultResolution::DemandZero => p.stats.major_faults += 1,
                FaultResolution::Cow(_) => p.stats.minor_faults += 1,
            }
        }
        Ok(resolution)
    }

    /// Terminate the current process after an unresolvable fault.
    pub fn kill_current_for_fault(&self, err: KernelError) {
        let pid = self.current_pid(0);
        log::error!("pid {} terminated by fault: {}", pid, err);
        let _ = self.kill(pid);
        let mut procs = self.procs.lock();
        let mut sched = self.sched.lock();
        sched.schedule(&mut procs, 0);
    }

    /// Periodic load-balance pass (driven by a software timer).
    pub fn balance(&self) -> Option<Pid> {
        let mut procs = self.procs.lock();
        let mut sched = self.sched.lock();
        load_balance::balance(&mut sched, &mut procs, 0)
    }

    /// Physical memory usage.
    pub fn memory_info(&self) -> MemoryInfo {
        self.frames.info()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::ProcessState;

    fn test_kernel() -> Kernel {
        Kernel::new(&BootInfo::fallback()).expect("kernel from fallback map")
    }

    #[test]
    fn boot_info_s1_memory_and_tree() {
        let kernel = test_kernel();
        let info = kernel.memory_info();
        // One 16 MiB RAM region at 1 MiB, minus the frames consumed by
        // the kernel-half page tables.
        assert_eq!(info.total, 0x100_0000);
        assert!(info.free > 0 && info.free < info.total);

        let names: alloc::vec::Vec<_> = kernel
            .vfs
            .list("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        for dir in ["bin", "sbin", "usr", "etc", "var", "tmp", "dev", "proc", "sys", "home"] {
            assert!(names.iter().any(|n| n == dir), "missing /{}", dir);
        }
    }

    #[test]
    fn spawn_enqueues_a_ready_process_with_std_fds() {
        let kernel = test_kernel();
        let pid = kernel
            .spawn("init", VirtualAddress::new(0x40_0000), 8192)
            .unwrap();
        let procs = kernel.procs.lock();
        let p = procs.get(pid).unwrap();
        assert_eq!(p.state, ProcessState::Ready);
        assert!(p.fds.contains_key(&0));
        assert!(p.fds.contains_key(&1));
        assert!(p.fds.contains_key(&2));
    }

    #[test]
    fn kill_zero_is_not_permitted() {
        let kernel = test_kernel();
        assert!(matches!(
            kernel.kill(0),
            Err(KernelError::NotPermitted { .. })
        ));
    }

    #[test]
    fn kill_releases_open_files() {
        let kernel = test_kernel();
        let before = kernel.vfs.open_file_count();
        let pid = kernel
            .spawn("victim", VirtualAddress::new(0x40_0000), 4096)
            .unwrap();
        assert_eq!(kernel.vfs.open_file_count(), before + 3);
        kernel.kill(pid).unwrap();
        assert_eq!(kernel.vfs.open_file_count(), before);
    }

    #[test]
    fn context_switch_is_applied_to_the_interrupt_frame() {
        let kernel = test_kernel();
        let pid = kernel
            .spawn("worker", VirtualAddress::new(0x41_0000), 4096)
            .unwrap();

        let mut ctx = InterruptContext::zeroed();
        ctx.cs = 0x08;
        ctx.rip = 0xFFFF_8000_0000_1234;

        // First tick switches from the kernel thread to the worker.
        kernel.on_timer_tick(&mut ctx);
        assert_eq!(kernel.current_pid(0), pid);
        assert_eq!(ctx.rip, 0x41_0000);
        assert_eq!(ctx.cs, 0x33);

        // The kernel thread's frame was saved.
        let procs = kernel.procs.lock();
        assert_eq!(
            procs.get(KERNEL_PID).unwrap().context.rip,
            0xFFFF_8000_0000_1234
        );
    }
}
