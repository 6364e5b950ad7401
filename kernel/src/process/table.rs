//! Process table: the PID-indexed slab of process control blocks and the
//! create/terminate/reap lifecycle.

use alloc::{collections::BTreeMap, vec::Vec};

use super::{Pid, Priority, Process, ProcessState, SchedPolicy, KERNEL_PID};
use crate::{
    arch::x86_64::context::CpuContext,
    error::{KernelError, KernelResult},
    mm::{
        vmm::{self, Vmm},
        FrameAllocator, MemoryRegion, Protection, VirtualAddress, PAGE_SIZE,
    },
};

/// Kernel stack size per process (four pages).
pub const KERNEL_STACK_SIZE: usize = 4 * PAGE_SIZE;

/// PID-indexed process slab. PIDs are allocated from a 1-based monotonic
/// counter; entries persist after termination until reaped by the parent.
pub struct ProcessTable {
    procs: BTreeMap<Pid, Process>,
    next_pid: Pid,
    /// Kernel stacks are plain heap allocations; kept here so their
    /// lifetime matches the table entry.
    kernel_stacks: BTreeMap<Pid, Vec<u8>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            next_pid: 1,
            kernel_stacks: BTreeMap::new(),
        }
    }

    /// Install the PID-0 kernel thread. Called once from the boot
    /// sequencer; the kernel thread is born Running on the boot CPU.
    pub fn insert_kernel_process(&mut self) {
        let mut kernel = Process::new(KERNEL_PID, KERNEL_PID, "kernel", SchedPolicy::Idle, Priority::Idle);
        kernel.state = ProcessState::Running;
        kernel.current_cpu = Some(0);
        self.procs.insert(KERNEL_PID, kernel);
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.procs.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Pid, &Process)> {
        self.procs.iter()
    }

    /// Create a process: allocate a PID, build its address space, map the
    /// user stack at the fixed high base (growing down), and construct the
    /// initial user-mode CPU context. The new process is left in the
    /// `Created` state; the scheduler enqueues it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        frames: &FrameAllocator,
        vm: &Vmm,
        name: &str,
        entry: VirtualAddress,
        stack_size: usize,
        policy: SchedPolicy,
        priority: Priority,
        parent: Pid,
    ) -> KernelResult<Pid> {
        let pid = self.next_pid;

        vm.create_address_space(frames, pid)?;

        let stack_pages = stack_size.div_ceil(PAGE_SIZE).max(1) as u64;
        let stack_top = VirtualAddress::new(vmm::USER_STACK_TOP);
        let stack_lo = VirtualAddress::new(vmm::USER_STACK_TOP - stack_pages * PAGE_SIZE as u64);

        let map_result: KernelResult<()> = (|| {
            vm.with_space(pid, |space| {
                space.add_region(MemoryRegion::new(
                    stack_lo,
                    stack_top,
                    Protection::READ | Protection::WRITE,
                    "stack",
                ))
            })?;
            for page in 0..stack_pages {
                let frame = frames.allocate()?;
                vmm::zero_user_frame(frame);
                let virt = VirtualAddress::new(stack_lo.as_u64() + page * PAGE_SIZE as u64);
                vm.map(
                    frames,
                    pid,
                    virt,
                    frame.as_addr(),
                    (Protection::READ | Protection::WRITE).to_page_flags(),
                )?;
            }
            Ok(())
        })();
        if let Err(e) = map_result {
            // Roll back the half-built address space before reporting.
            let _ = vm.destroy_address_space(frames, pid);
            return Err(e);
        }

        let cr3 = vm.with_space(pid, |space| Ok(space.root_addr()))?;

        let kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE];
        let kernel_stack_top = kernel_stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64;

        let mut process = Process::new(pid, parent, name, policy, priority);
        process.context = CpuContext::new_user(entry.as_u64(), stack_top.as_u64(), cr3.as_u64());
        process.kernel_stack_top = kernel_stack_top;
        process.user_stack = (stack_lo, stack_top);

        self.next_pid += 1;
        self.kernel_stacks.insert(pid, kernel_stack);
        self.procs.insert(pid, process);

        log::info!(
            "process: created pid {} ({:?}) entry={:#x} stack={}K",
            pid,
            name,
            entry.as_u64(),
            stack_pages * 4
        );
        Ok(pid)
    }

    /// Terminate a process: mark it `Terminated`, release its address
    /// space and user frames, and clear the descriptor table. The PCB
    /// stays in the table until [`reap`](Self::reap). The caller is
    /// responsible for detaching the process from run queues first.
    pub fn terminate(
        &mut self,
        frames: &FrameAllocator,
        vm: &Vmm,
        pid: Pid,
        exit_code: i64,
    ) -> KernelResult<()> {
        if pid == KERNEL_PID {
            return Err(KernelError::NotPermitted {
                operation: "terminate the kernel thread",
            });
        }
        let process = self.procs.get_mut(&pid).ok_or(KernelError::NotFound {
            resource: "process",
        })?;
        if process.state == ProcessState::Terminated {
            return Ok(()); // Terminated is absorbing
        }

        process.state = ProcessState::Terminated;
        process.exit_code = Some(exit_code);
        process.current_cpu = None;
        process.fds.clear();

        vm.destroy_address_space(frames, pid)?;
        self.kernel_stacks.remove(&pid);

        log::info!("process: pid {} terminated (code {})", pid, exit_code);
        Ok(())
    }

    /// Remove a terminated child's PCB. Only the parent reaps.
    pub fn reap(&mut self, parent: Pid, pid: Pid) -> KernelResult<i64> {
        let process = self.procs.get(&pid).ok_or(KernelError::NotFound {
            resource: "process",
        })?;
        if process.parent != parent {
            return Err(KernelError::NotPermitted {
                operation: "reap a process that is not a child",
            });
        }
        if process.state != ProcessState::Terminated {
            return Err(KernelError::Invalid {
                what: "reap of a live process",
            });
        }
        let code = process.exit_code.unwrap_or(0);
        self.procs.remove(&pid);
        Ok(code)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::{boot::RegionType, mm::PhysicalAddress};

    fn setup() -> (FrameAllocator, Vmm, ProcessTable) {
        let frames = FrameAllocator::new();
        frames.add_region(
            PhysicalAddress::new(0x10_0000),
            0x100_0000,
            RegionType::Ram,
        );
        let vmm = Vmm::new();
        vmm.init_kernel_space(&frames).unwrap();
        let mut table = ProcessTable::new();
        table.insert_kernel_process();
        (frames, vmm, table)
    }

    #[test]
    fn pids_are_monotonic_from_one() {
        let (frames, vmm, mut table) = setup();
        let a = table
            .create(
                &frames,
                &vmm,
                "a",
                VirtualAddress::new(0x40_0000),
                8192,
                SchedPolicy::Cfs,
                Priority::Normal,
                KERNEL_PID,
            )
            .unwrap();
        let b = table
            .create(
                &frames,
                &vmm,
                "b",
                VirtualAddress::new(0x40_0000),
                8192,
                SchedPolicy::Cfs,
                Priority::Normal,
                KERNEL_PID,
            )
            .unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn created_process_has_stack_mapped_and_user_context() {
        let (frames, vmm, mut table) = setup();
        let pid = table
            .create(
                &frames,
                &vmm,
                "init",
                VirtualAddress::new(0x40_0000),
                2 * PAGE_SIZE,
                SchedPolicy::Cfs,
                Priority::Normal,
                KERNEL_PID,
            )
            .unwrap();

        let p = table.get(pid).unwrap();
        assert_eq!(p.state, ProcessState::Created);
        assert_eq!(p.context.rip, 0x40_0000);
        assert_eq!(p.context.rsp, vmm::USER_STACK_TOP);
        assert_eq!(p.context.cs, 0x33);
        // RFLAGS has IF set: the process starts with interrupts enabled.
        assert_ne!(p.context.rflags & 0x200, 0);

        // Both stack pages translate.
        let (lo, hi) = p.user_stack;
        assert_eq!(hi.as_u64() - lo.as_u64(), 2 * PAGE_SIZE as u64);
        assert!(vmm.translate(pid, lo).is_ok());
        assert!(vmm
            .translate(pid, VirtualAddress::new(hi.as_u64() - PAGE_SIZE as u64))
            .is_ok());
    }

    #[test]
    fn kill_pid_zero_is_not_permitted() {
        let (frames, vmm, mut table) = setup();
        assert!(matches!(
            table.terminate(&frames, &vmm, KERNEL_PID, 0),
            Err(KernelError::NotPermitted { .. })
        ));
    }

    #[test]
    fn terminate_frees_address_space_and_is_absorbing() {
        let (frames, vmm, mut table) = setup();
        let baseline = frames.free_frames();
        let pid = table
            .create(
                &frames,
                &vmm,
                "t",
                VirtualAddress::new(0x40_0000),
                PAGE_SIZE,
                SchedPolicy::Cfs,
                Priority::Normal,
                KERNEL_PID,
            )
            .unwrap();
        table.terminate(&frames, &vmm, pid, 7).unwrap();

        assert_eq!(frames.free_frames(), baseline);
        assert!(!vmm.has_space(pid));
        let p = table.get(pid).unwrap();
        assert_eq!(p.state, ProcessState::Terminated);
        assert_eq!(p.exit_code, Some(7));

        // A second terminate is a no-op, not an error.
        table.terminate(&frames, &vmm, pid, 9).unwrap();
        assert_eq!(table.get(pid).unwrap().exit_code, Some(7));
    }

    #[test]
    fn reap_removes_only_terminated_children() {
        let (frames, vmm, mut table) = setup();
        let pid = table
            .create(
                &frames,
                &vmm,
                "child",
                VirtualAddress::new(0x40_0000),
                PAGE_SIZE,
                SchedPolicy::Cfs,
                Priority::Normal,
                KERNEL_PID,
            )
            .unwrap();

        assert!(table.reap(KERNEL_PID, pid).is_err()); // still alive
        table.terminate(&frames, &vmm, pid, 3).unwrap();
        assert!(table.reap(42, pid).is_err()); // not the parent
        assert_eq!(table.reap(KERNEL_PID, pid).unwrap(), 3);
        assert!(!table.contains(pid));
    }

    #[test]
    fn terminate_unknown_pid_is_not_found() {
        let (frames, vmm, mut table) = setup();
        assert!(matches!(
            table.terminate(&frames, &vmm, 99, 0),
            Err(KernelError::NotFound { .. })
        ));
    }
}
