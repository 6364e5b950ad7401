//! Load balancing between CPUs.
//!
//! Runs on a periodic timer (every [`BALANCE_INTERVAL_MS`]
//! (super::BALANCE_INTERVAL_MS) milliseconds). The current CPU examines
//! every run queue by total weight and, when the most loaded CPU carries
//! more than twice its own weight, pulls one affinity-eligible process
//! over. The migration cost is charged to the migrant's vruntime so it is
//! not immediately rescheduled back.

use super::{scheduler::Scheduler, MIGRATION_COST_NS};
use crate::process::{Pid, ProcessTable, NICE_0_WEIGHT};

/// One balancing pass for `current_cpu`. Returns the migrated PID, if any.
pub fn balance(sched: &mut Scheduler, procs: &mut ProcessTable, current_cpu: usize) -> Option<Pid> {
    if sched.nr_cpus() < 2 {
        return None;
    }

    let my_weight = sched.queue_weight(current_cpu);
    let (busiest, busiest_weight) = (0..sched.nr_cpus())
        .filter(|&cpu| cpu != current_cpu)
        .map(|cpu| (cpu, sched.queue_weight(cpu)))
        .max_by_key(|&(_, w)| w)?;

    if busiest_weight <= my_weight.saturating_mul(2) || busiest_weight == 0 {
        return None;
    }

    let pid = sched.steal_one(procs, busiest, current_cpu)?;

    if let Some(p) = procs.get_mut(pid) {
        // Charge the migration so the migrant sorts behind freshly
        // enqueued peers on the new queue.
        let weight = p.weight();
        p.vruntime += MIGRATION_COST_NS * NICE_0_WEIGHT / weight;
        p.stats.migrations += 1;
    }

    if sched.enqueue_on_cpu(procs, pid, current_cpu).is_err() {
        // Affinity was checked by steal_one; a failure here means the
        // process died in between. Nothing to migrate after all.
        return None;
    }

    log::debug!(
        "sched: migrated pid {} from cpu {} to cpu {}",
        pid,
        busiest,
        current_cpu
    );
    Some(pid)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::{
        boot::RegionType,
        mm::{FrameAllocator, PhysicalAddress, Vmm, VirtualAddress, PAGE_SIZE},
        process::{CpuSet, Priority, SchedPolicy, KERNEL_PID},
    };

    fn setup(nr_cpus: usize) -> (FrameAllocator, Vmm, ProcessTable, Scheduler) {
        let frames = FrameAllocator::new();
        frames.add_region(
            PhysicalAddress::new(0x10_0000),
            0x100_0000,
            RegionType::Ram,
        );
        let vmm = Vmm::new();
        vmm.init_kernel_space(&frames).unwrap();
        let mut procs = ProcessTable::new();
        procs.insert_kernel_process();
        (frames, vmm, procs, Scheduler::new(nr_cpus))
    }

    fn spawn_on(
        frames: &FrameAllocator,
        vmm: &Vmm,
        procs: &mut ProcessTable,
        sched: &mut Scheduler,
        cpu: usize,
    ) -> Pid {
        let pid = procs
            .create(
                frames,
                vmm,
                "w",
                VirtualAddress::new(0x40_0000),
                PAGE_SIZE,
                SchedPolicy::Cfs,
                Priority::Normal,
                KERNEL_PID,
            )
            .unwrap();
        sched.enqueue_on_cpu(procs, pid, cpu).unwrap();
        pid
    }

    #[test]
    fn migrates_from_overloaded_cpu() {
        let (frames, vmm, mut procs, mut sched) = setup(2);
        for _ in 0..4 {
            spawn_on(&frames, &vmm, &mut procs, &mut sched, 0);
        }
        assert_eq!(sched.nr_ready(0), 4);
        assert_eq!(sched.nr_ready(1), 0);

        let migrated = balance(&mut sched, &mut procs, 1);
        assert!(migrated.is_some());
        assert_eq!(sched.nr_ready(0), 3);
        assert_eq!(sched.nr_ready(1), 1);

        let p = procs.get(migrated.unwrap()).unwrap();
        assert_eq!(p.stats.migrations, 1);
        // 500 us at nice-0 weight.
        assert_eq!(p.vruntime, MIGRATION_COST_NS);
    }

    #[test]
    fn balanced_queues_stay_put() {
        let (frames, vmm, mut procs, mut sched) = setup(2);
        spawn_on(&frames, &vmm, &mut procs, &mut sched, 0);
        spawn_on(&frames, &vmm, &mut procs, &mut sched, 1);

        assert!(balance(&mut sched, &mut procs, 1).is_none());
        assert_eq!(sched.nr_ready(0), 1);
        assert_eq!(sched.nr_ready(1), 1);
    }

    #[test]
    fn affinity_blocks_migration() {
        let (frames, vmm, mut procs, mut sched) = setup(2);
        let mut pids = alloc::vec::Vec::new();
        for _ in 0..4 {
            pids.push(spawn_on(&frames, &vmm, &mut procs, &mut sched, 0));
        }
        // Pin everything to CPU 0; nothing is eligible to move.
        for &pid in &pids {
            procs.get_mut(pid).unwrap().affinity = CpuSet::single(0);
        }

        assert!(balance(&mut sched, &mut procs, 1).is_none());
        assert_eq!(sched.nr_ready(0), 4);
    }

    #[test]
    fn single_cpu_never_balances() {
        let (frames, vmm, mut procs, mut sched) = setup(1);
        for _ in 0..3 {
            spawn_on(&frames, &vmm, &mut procs, &mut sched, 0);
        }
        assert!(balance(&mut sched, &mut procs, 0).is_none());
    }
}
