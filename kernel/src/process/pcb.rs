//! Process control block.

use alloc::{collections::BTreeMap, string::String};

use super::{nice_scale, CpuSet, Pid, Priority, ProcessState, SchedPolicy};
use crate::{arch::x86_64::context::CpuContext, mm::VirtualAddress};

/// Per-process accounting counters.
#[derive(Debug, Default, Clone)]
pub struct ProcStats {
    /// Timer ticks spent running.
    pub run_ticks: u64,
    /// Context switches where the process gave up the CPU (block, sleep,
    /// yield, exit).
    pub voluntary_switches: u64,
    /// Context switches where the process was preempted.
    pub involuntary_switches: u64,
    /// Faults resolved without frame allocation (COW).
    pub minor_faults: u64,
    /// Faults that allocated a frame (demand zero).
    pub major_faults: u64,
    /// Cross-CPU migrations by the load balancer.
    pub migrations: u64,
}

/// Process control block.
pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub name: String,
    pub state: ProcessState,

    pub priority: Priority,
    pub nice: i8,
    pub policy: SchedPolicy,
    /// Priority among RealTime-policy processes (higher wins). Ignored for
    /// other policies.
    pub rt_priority: u8,

    /// Nanoseconds of fair runtime consumed (CFS key).
    pub vruntime: u64,
    pub affinity: CpuSet,
    /// CPU currently running this process, if any.
    pub current_cpu: Option<u8>,
    /// Timer ticks left in the current slice.
    pub time_slice: u32,

    /// Saved CPU state, loaded on the next switch to this process.
    pub context: CpuContext,
    /// Top of the kernel stack used on ring transitions.
    pub kernel_stack_top: u64,
    /// User stack range [lo, hi); the stack grows down from hi.
    pub user_stack: (VirtualAddress, VirtualAddress),

    /// Descriptor table: process-local fd -> open-file table id.
    pub fds: BTreeMap<u32, u64>,
    pub next_fd: u32,
    /// Errno-style code of the last failed syscall.
    pub errno: i64,

    pub stats: ProcStats,
    pub exit_code: Option<i64>,
}

impl Process {
    /// Construct a PCB in the `Created` state. The caller wires up the
    /// address space, stacks, and context.
    pub fn new(pid: Pid, parent: Pid, name: &str, policy: SchedPolicy, priority: Priority) -> Self {
        Self {
            pid,
            parent,
            name: String::from(name),
            state: ProcessState::Created,
            priority,
            nice: 0,
            policy,
            rt_priority: 0,
            vruntime: 0,
            affinity: CpuSet::all(),
            current_cpu: None,
            time_slice: 0,
            context: CpuContext::new_user(0, 0, 0),
            kernel_stack_top: 0,
            user_stack: (VirtualAddress::new(0), VirtualAddress::new(0)),
            fds: BTreeMap::new(),
            next_fd: 3, // 0/1/2 are wired to the console at spawn
            errno: 0,
            stats: ProcStats::default(),
            exit_code: None,
        }
    }

    /// Effective CFS weight: priority weight scaled by niceness.
    pub fn weight(&self) -> u64 {
        match self.policy {
            SchedPolicy::Cfs | SchedPolicy::Batch => nice_scale(self.priority.weight(), self.nice),
            _ => self.priority.weight(),
        }
    }

    pub fn can_run_on(&self, cpu: u8) -> bool {
        self.affinity.contains(cpu)
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.state, ProcessState::Ready | ProcessState::Running)
    }

    /// Allocate the next process-local file descriptor.
    pub fn alloc_fd(&mut self, open_id: u64) -> u32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, open_id);
        fd
    }

    /// Resolve a process-local fd to an open-file table id.
    pub fn lookup_fd(&self, fd: u32) -> Option<u64> {
        self.fds.get(&fd).copied()
    }

    pub fn record_switch(&mut self, voluntary: bool) {
        if voluntary {
            self.stats.voluntary_switches += 1;
        } else {
            self.stats.involuntary_switches += 1;
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn fresh_process_starts_created_with_std_fds_reserved() {
        let p = Process::new(1, 0, "init", SchedPolicy::Cfs, Priority::Normal);
        assert_eq!(p.state, ProcessState::Created);
        assert_eq!(p.next_fd, 3);
        assert_eq!(p.vruntime, 0);
        assert!(p.exit_code.is_none());
    }

    #[test]
    fn weight_tracks_nice_for_cfs_only() {
        let mut p = Process::new(1, 0, "a", SchedPolicy::Cfs, Priority::Normal);
        assert_eq!(p.weight(), 1024);
        p.nice = 1;
        assert_eq!(p.weight(), 819);

        let mut rt = Process::new(2, 0, "rt", SchedPolicy::RealTime, Priority::RealTime);
        rt.nice = 5;
        assert_eq!(rt.weight(), Priority::RealTime.weight());
    }

    #[test]
    fn fd_allocation_is_sequential() {
        let mut p = Process::new(1, 0, "a", SchedPolicy::Cfs, Priority::Normal);
        assert_eq!(p.alloc_fd(100), 3);
        assert_eq!(p.alloc_fd(101), 4);
        assert_eq!(p.lookup_fd(3), Some(100));
        assert_eq!(p.lookup_fd(9), None);
    }
}
