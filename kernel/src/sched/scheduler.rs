//! Core scheduler implementation.
//!
//! The scheduler owns one [`RunQueue`] per CPU and drives every state
//! transition of the process lifecycle:
//!
//! ```text
//!  Created -> Ready    (enqueue)
//!  Ready   -> Running  (selected by schedule)
//!  Running -> Ready    (preempted by tick or yield)
//!  Running -> Blocked  (wait on I/O or sleep)
//!  Blocked -> Ready    (I/O completion or timer)
//!  Running -> Terminated (exit)
//! ```
//!
//! All methods take the process table explicitly; the scheduler itself
//! holds only PIDs, never pointers into the table.

use alloc::{collections::BTreeMap, vec::Vec};

use super::{
    queue::{QueueEntry, RunQueue},
    MAX_CPUS, MIN_GRANULARITY_NS, TARGET_LATENCY_NS, TICK_NS,
};
use crate::{
    error::{KernelError, KernelResult},
    process::{Pid, ProcessState, ProcessTable, SchedPolicy, NICE_0_WEIGHT},
};

/// Outcome of a scheduling decision, consumed by the interrupt-return glue
/// that performs the actual context save/restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// Process that was running before the decision.
    pub prev: Option<Pid>,
    /// Process that should run after it. Equal to `prev` when nothing
    /// changes; `None` means the idle loop.
    pub next: Option<Pid>,
}

impl Switch {
    pub fn changed(&self) -> bool {
        self.prev != self.next
    }
}

struct CpuScheduler {
    queue: RunQueue,
    current: Option<Pid>,
}

/// Per-CPU scheduler state plus the sleep queue.
pub struct Scheduler {
    cpus: Vec<CpuScheduler>,
    /// wake tick -> processes to wake.
    sleeping: BTreeMap<u64, Vec<Pid>>,
    context_switches: u64,
}

impl Scheduler {
    pub fn new(nr_cpus: usize) -> Self {
        let nr = nr_cpus.clamp(1, MAX_CPUS);
        let mut cpus = Vec::with_capacity(nr);
        for _ in 0..nr {
            cpus.push(CpuScheduler {
                queue: RunQueue::new(),
                current: None,
            });
        }
        Self {
            cpus,
            sleeping: BTreeMap::new(),
            context_switches: 0,
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// The process running on `cpu`, if any.
    pub fn current(&self, cpu: usize) -> Option<Pid> {
        self.cpus.get(cpu).and_then(|c| c.current)
    }

    /// Mark `pid` as the process already running on `cpu` (used at boot to
    /// install the kernel thread without a queue round trip).
    pub fn adopt_running(&mut self, procs: &mut ProcessTable, cpu: usize, pid: Pid) {
        if let Some(p) = procs.get_mut(pid) {
            p.state = ProcessState::Running;
            p.current_cpu = Some(cpu as u8);
        }
        self.cpus[cpu].current = Some(pid);
    }

    pub fn nr_ready(&self, cpu: usize) -> usize {
        self.cpus[cpu].queue.nr_ready()
    }

    pub fn queue_weight(&self, cpu: usize) -> u64 {
        self.cpus[cpu].queue.total_weight()
    }

    /// Lifetime context-switch count.
    pub fn context_switches(&self) -> u64 {
        self.context_switches
    }

    // -- enqueue ------------------------------------------------------------

    /// Make `pid` Ready and place it on a run queue chosen by affinity and
    /// load.
    pub fn enqueue(&mut self, procs: &mut ProcessTable, pid: Pid) -> KernelResult<()> {
        let cpu = self.choose_cpu(procs, pid)?;
        self.enqueue_on_cpu(procs, pid, cpu)
    }

    /// Make `pid` Ready on a specific CPU's queue.
    pub fn enqueue_on_cpu(
        &mut self,
        procs: &mut ProcessTable,
        pid: Pid,
        cpu: usize,
    ) -> KernelResult<()> {
        let p = procs.get_mut(pid).ok_or(KernelError::NotFound {
            resource: "process",
        })?;
        if p.state == ProcessState::Terminated {
            return Err(KernelError::Invalid {
                what: "enqueue of a terminated process",
            });
        }
        if !p.can_run_on(cpu as u8) {
            return Err(KernelError::Invalid {
                what: "enqueue on a CPU outside the affinity mask",
            });
        }

        p.state = ProcessState::Ready;
        p.current_cpu = None;
        let entry = QueueEntry {
            pid,
            policy: p.policy,
            rt_priority: p.rt_priority,
            vruntime: p.vruntime,
            weight: p.weight(),
        };
        let effective = self.cpus[cpu].queue.enqueue(entry);
        if entry.policy == SchedPolicy::Cfs {
            // Write the sleep clamp back so the PCB matches the queue key.
            if let Some(p) = procs.get_mut(pid) {
                p.vruntime = effective;
            }
        }
        Ok(())
    }

    fn choose_cpu(&self, procs: &ProcessTable, pid: Pid) -> KernelResult<usize> {
        let p = procs.get(pid).ok_or(KernelError::NotFound {
            resource: "process",
        })?;
        // Prefer the last CPU for cache warmth, else the least loaded
        // CPU the affinity mask allows.
        if let Some(cpu) = p.current_cpu {
            if p.can_run_on(cpu) {
                return Ok(cpu as usize);
            }
        }
        (0..self.cpus.len())
            .filter(|&c| p.can_run_on(c as u8))
            .min_by_key(|&c| self.cpus[c].queue.nr_ready())
            .ok_or(KernelError::Invalid {
                what: "affinity mask excludes every CPU",
            })
    }

    // -- time slices --------------------------------------------------------

    /// Slice for the process about to run: target latency divided by the
    /// number of ready processes, clamped below by the minimum
    /// granularity, scaled by priority, and rounded up to whole ticks.
    fn compute_slice_ticks(&self, procs: &ProcessTable, cpu: usize, pid: Pid) -> u32 {
        let nr = (self.cpus[cpu].queue.nr_ready() + 1) as u64;
        let base = (TARGET_LATENCY_NS / nr).max(MIN_GRANULARITY_NS);
        let scaled = procs
            .get(pid)
            .map(|p| p.priority.scale_slice(base))
            .unwrap_or(base)
            .max(MIN_GRANULARITY_NS);
        scaled.div_ceil(TICK_NS).max(1) as u32
    }

    // -- core decision ------------------------------------------------------

    /// Pick the next process for `cpu` and update lifecycle states. The
    /// outgoing process, if still Running, is preempted back to its queue.
    pub fn schedule(&mut self, procs: &mut ProcessTable, cpu: usize) -> Switch {
        let prev = self.cpus[cpu].current;

        // Skip entries that died while queued.
        let next = loop {
            match self.cpus[cpu].queue.pick_next() {
                None => break None,
                Some(pid) => {
                    if procs
                        .get(pid)
                        .is_some_and(|p| p.state == ProcessState::Ready)
                    {
                        break Some(pid);
                    }
                }
            }
        };

        let Some(next_pid) = next else {
            // Nothing ready: keep a still-running current, otherwise idle.
            if let Some(cur) = prev {
                let still_running = procs
                    .get(cur)
                    .is_some_and(|p| p.state == ProcessState::Running);
                if still_running {
                    let slice = self.compute_slice_ticks(procs, cpu, cur);
                    if let Some(p) = procs.get_mut(cur) {
                        p.time_slice = slice;
                    }
                    return Switch {
                        prev: Some(cur),
                        next: Some(cur),
                    };
                }
                if let Some(p) = procs.get_mut(cur) {
                    p.current_cpu = None;
                }
                self.cpus[cpu].current = None;
            }
            return Switch { prev, next: None };
        };

        // Preempt the outgoing process.
        if let Some(cur) = prev {
            if cur != next_pid {
                let was_running = match procs.get_mut(cur) {
                    Some(p) => {
                        p.current_cpu = None;
                        let running = p.state == ProcessState::Running;
                        if running {
                            p.record_switch(false);
                        }
                        running
                    }
                    None => false,
                };
                if was_running {
                    // Re-enqueue; enqueue_on_cpu flips state to Ready.
                    let _ = self.enqueue_on_cpu(procs, cur, cpu);
                }
            }
        }

        let slice = self.compute_slice_ticks(procs, cpu, next_pid);
        if let Some(p) = procs.get_mut(next_pid) {
            p.state = ProcessState::Running;
            p.current_cpu = Some(cpu as u8);
            p.time_slice = slice;
        }
        self.cpus[cpu].current = Some(next_pid);
        if prev != Some(next_pid) {
            self.context_switches += 1;
        }

        Switch {
            prev,
            next: Some(next_pid),
        }
    }

    // -- tick ---------------------------------------------------------------

    /// Timer-tick entry: wake due sleepers, charge the running process one
    /// tick of runtime and vruntime, and reschedule when its slice is
    /// exhausted (or nothing is running).
    pub fn tick(&mut self, procs: &mut ProcessTable, cpu: usize, now_tick: u64) -> Switch {
        self.wake_due(procs, now_tick);

        let Some(cur) = self.cpus[cpu].current else {
            return self.schedule(procs, cpu);
        };

        let mut need_resched = false;
        if let Some(p) = procs.get_mut(cur) {
            p.stats.run_ticks += 1;
            if matches!(p.policy, SchedPolicy::Cfs | SchedPolicy::Batch) {
                let weight = p.weight();
                p.vruntime += TICK_NS * NICE_0_WEIGHT / weight;
            }
            p.time_slice = p.time_slice.saturating_sub(1);
            need_resched = p.time_slice == 0 || p.state != ProcessState::Running;
        }

        if need_resched {
            self.schedule(procs, cpu)
        } else {
            Switch {
                prev: Some(cur),
                next: Some(cur),
            }
        }
    }

    fn wake_due(&mut self, procs: &mut ProcessTable, now_tick: u64) {
        let due: Vec<u64> = self
            .sleeping
            .range(..=now_tick)
            .map(|(&tick, _)| tick)
            .collect();
        for tick in due {
            if let Some(pids) = self.sleeping.remove(&tick) {
                for pid in pids {
                    self.wake(procs, pid);
                }
            }
        }
    }

    // -- voluntary transitions ----------------------------------------------

    /// Cooperative yield: the current process goes back to its queue and
    /// the next one is selected.
    pub fn yield_current(&mut self, procs: &mut ProcessTable, cpu: usize) -> Switch {
        if let Some(cur) = self.cpus[cpu].current {
            let was_running = match procs.get_mut(cur) {
                Some(p) if p.state == ProcessState::Running => {
                    p.record_switch(true);
                    p.current_cpu = None;
                    true
                }
                _ => false,
            };
            if was_running {
                let _ = self.enqueue_on_cpu(procs, cur, cpu);
            }
            self.cpus[cpu].current = None;
        }
        self.schedule(procs, cpu)
    }

    /// Block the current process (I/O wait). The waker calls
    /// [`wake`](Self::wake).
    pub fn block_current(&mut self, procs: &mut ProcessTable, cpu: usize) -> Switch {
        if let Some(cur) = self.cpus[cpu].current {
            if let Some(p) = procs.get_mut(cur) {
                p.state = ProcessState::Blocked;
                p.record_switch(true);
            }
        }
        self.schedule(procs, cpu)
    }

    /// Sleep the current process for `ms` milliseconds, clamped up to the
    /// 10 ms tick.
    pub fn sleep_current(
        &mut self,
        procs: &mut ProcessTable,
        cpu: usize,
        ms: u64,
        now_tick: u64,
    ) -> Switch {
        if let Some(cur) = self.cpus[cpu].current {
            let ticks = ms.div_ceil(TICK_NS / 1_000_000).max(1);
            self.sleeping.entry(now_tick + ticks).or_default().push(cur);
        }
        self.block_current(procs, cpu)
    }

    /// Wake a blocked process (I/O completion or timer expiry).
    pub fn wake(&mut self, procs: &mut ProcessTable, pid: Pid) {
        let blocked = procs
            .get(pid)
            .is_some_and(|p| p.state == ProcessState::Blocked);
        if blocked {
            let _ = self.enqueue(procs, pid);
        }
    }

    // -- removal ------------------------------------------------------------

    /// Detach `pid` from every run queue, the sleep queue, and any CPU it
    /// is current on. Used by kill/exit.
    pub fn remove(&mut self, procs: &mut ProcessTable, pid: Pid) {
        let (policy, vruntime) = match procs.get(pid) {
            Some(p) => (p.policy, p.vruntime),
            None => (SchedPolicy::Cfs, 0),
        };
        for cpu in &mut self.cpus {
            if cpu.current == Some(pid) {
                cpu.current = None;
            }
            cpu.queue.remove(pid, policy, vruntime);
        }
        for pids in self.sleeping.values_mut() {
            pids.retain(|&p| p != pid);
        }
        if let Some(p) = procs.get_mut(pid) {
            p.current_cpu = None;
        }
    }

    // -- load balancing support ---------------------------------------------

    /// Pop one process from `from_cpu`'s queue whose affinity allows
    /// `to_cpu`. Non-eligible processes are put back in order.
    pub(super) fn steal_one(
        &mut self,
        procs: &mut ProcessTable,
        from_cpu: usize,
        to_cpu: usize,
    ) -> Option<Pid> {
        let mut rejected = Vec::new();
        let mut stolen = None;

        let max_attempts = self.cpus[from_cpu].queue.nr_ready();
        for _ in 0..max_attempts {
            let Some(pid) = self.cpus[from_cpu].queue.pick_next() else {
                break;
            };
            let eligible = procs.get(pid).is_some_and(|p| p.can_run_on(to_cpu as u8));
            if eligible {
                stolen = Some(pid);
                break;
            }
            rejected.push(pid);
        }

        for pid in rejected {
            let _ = self.enqueue_on_cpu(procs, pid, from_cpu);
        }
        stolen
    }
}
