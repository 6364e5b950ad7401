//! Run queue structures.
//!
//! Each CPU owns one [`RunQueue`]: FIFO lanes for the RoundRobin, Batch,
//! and Idle policies, a priority-bucketed FIFO for RealTime, and a CFS
//! lane ordered by (vruntime, pid) so that equal vruntimes resolve to the
//! lower PID. A process appears in at most one lane at a time.

use alloc::collections::{BTreeMap, VecDeque};

use crate::process::{Pid, SchedPolicy};

/// Plain FIFO lane holding (pid, weight) pairs.
#[derive(Default)]
pub struct FifoLane {
    queue: VecDeque<(Pid, u64)>,
}

impl FifoLane {
    pub fn push(&mut self, pid: Pid, weight: u64) {
        self.queue.push_back((pid, weight));
    }

    pub fn pop(&mut self) -> Option<(Pid, u64)> {
        self.queue.pop_front()
    }

    pub fn remove(&mut self, pid: Pid) -> Option<u64> {
        let idx = self.queue.iter().position(|&(p, _)| p == pid)?;
        self.queue.remove(idx).map(|(_, w)| w)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// RealTime lane: FIFO per priority bucket; dequeue takes the highest
/// priority, round-robin within it (earliest-arrived first).
#[derive(Default)]
pub struct RtLane {
    buckets: BTreeMap<u8, VecDeque<(Pid, u64)>>,
    len: usize,
}

impl RtLane {
    pub fn push(&mut self, pid: Pid, rt_priority: u8, weight: u64) {
        self.buckets
            .entry(rt_priority)
            .or_default()
            .push_back((pid, weight));
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<(Pid, u64)> {
        let (&prio, _) = self.buckets.iter().next_back()?;
        let bucket = self.buckets.get_mut(&prio)?;
        let entry = bucket.pop_front();
        if bucket.is_empty() {
            self.buckets.remove(&prio);
        }
        if entry.is_some() {
            self.len -= 1;
        }
        entry
    }

    pub fn remove(&mut self, pid: Pid) -> Option<u64> {
        let mut found = None;
        for (&prio, bucket) in self.buckets.iter_mut() {
            if let Some(idx) = bucket.iter().position(|&(p, _)| p == pid) {
                found = bucket.remove(idx).map(|(_, w)| (prio, w));
                break;
            }
        }
        let (prio, weight) = found?;
        if self.buckets.get(&prio).is_some_and(|b| b.is_empty()) {
            self.buckets.remove(&prio);
        }
        self.len -= 1;
        Some(weight)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// CFS lane: an ordered map from (vruntime, pid) to weight. Minimum
/// vruntime dequeues first; ties go to the lower PID.
#[derive(Default)]
pub struct CfsLane {
    tree: BTreeMap<(u64, Pid), u64>,
    min_vruntime: u64,
}

impl CfsLane {
    /// Enqueue a process. The stored vruntime is clamped up to the queue's
    /// minimum so a long sleep cannot turn into an unbounded priority
    /// boost; the effective value is returned for write-back.
    pub fn push(&mut self, pid: Pid, vruntime: u64, weight: u64) -> u64 {
        let effective = vruntime.max(self.min_vruntime);
        self.tree.insert((effective, pid), weight);
        effective
    }

    pub fn pop_min(&mut self) -> Option<(Pid, u64, u64)> {
        let (&(vruntime, pid), &weight) = self.tree.iter().next()?;
        self.tree.remove(&(vruntime, pid));
        self.min_vruntime = self.min_vruntime.max(vruntime);
        Some((pid, vruntime, weight))
    }

    pub fn remove(&mut self, pid: Pid, vruntime: u64) -> Option<u64> {
        if let Some(weight) = self.tree.remove(&(vruntime, pid)) {
            return Some(weight);
        }
        // The stored key can drift from the PCB copy; scan as a fallback.
        let key = self.tree.keys().find(|&&(_, p)| p == pid).copied()?;
        self.tree.remove(&key)
    }

    pub fn min_vruntime(&self) -> u64 {
        self.min_vruntime
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Per-CPU run queue: all lanes plus aggregate bookkeeping.
#[derive(Default)]
pub struct RunQueue {
    rt: RtLane,
    cfs: CfsLane,
    round_robin: FifoLane,
    batch: FifoLane,
    idle: FifoLane,
    total_weight: u64,
}

/// Everything the queue needs to know to place a process.
#[derive(Debug, Clone, Copy)]
pub struct QueueEntry {
    pub pid: Pid,
    pub policy: SchedPolicy,
    pub rt_priority: u8,
    pub vruntime: u64,
    pub weight: u64,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a process in its policy's lane. Returns the effective
    /// vruntime (clamped for CFS, unchanged otherwise).
    pub fn enqueue(&mut self, entry: QueueEntry) -> u64 {
        self.total_weight += entry.weight;
        match entry.policy {
            SchedPolicy::RealTime => {
                self.rt.push(entry.pid, entry.rt_priority, entry.weight);
                entry.vruntime
            }
            SchedPolicy::Cfs => self.cfs.push(entry.pid, entry.vruntime, entry.weight),
            SchedPolicy::RoundRobin => {
                self.round_robin.push(entry.pid, entry.weight);
                entry.vruntime
            }
            SchedPolicy::Batch => {
                self.batch.push(entry.pid, entry.weight);
                entry.vruntime
            }
            SchedPolicy::Idle => {
                self.idle.push(entry.pid, entry.weight);
                entry.vruntime
            }
        }
    }

    /// Dequeue the next process to run: RealTime, then CFS minimum
    /// vruntime, then the remaining FIFO lanes.
    pub fn pick_next(&mut self) -> Option<Pid> {
        let popped = self
            .rt
            .pop()
            .or_else(|| self.cfs.pop_min().map(|(pid, _, w)| (pid, w)))
            .or_else(|| self.round_robin.pop())
            .or_else(|| self.batch.pop())
            .or_else(|| self.idle.pop())?;
        self.total_weight = self.total_weight.saturating_sub(popped.1);
        Some(popped.0)
    }

    /// Detach a process from whichever lane holds it.
    pub fn remove(&mut self, pid: Pid, policy: SchedPolicy, vruntime: u64) -> bool {
        let weight = match policy {
            SchedPolicy::RealTime => self.rt.remove(pid),
            SchedPolicy::Cfs => self.cfs.remove(pid, vruntime),
            SchedPolicy::RoundRobin => self.round_robin.remove(pid),
            SchedPolicy::Batch => self.batch.remove(pid),
            SchedPolicy::Idle => self.idle.remove(pid),
        };
        match weight {
            Some(w) => {
                self.total_weight = self.total_weight.saturating_sub(w);
                true
            }
            None => false,
        }
    }

    /// Number of ready processes across all lanes.
    pub fn nr_ready(&self) -> usize {
        self.rt.len() + self.cfs.len() + self.round_robin.len() + self.batch.len() + self.idle.len()
    }

    /// Combined weight of every queued process, for load balancing.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Minimum vruntime seen by the CFS lane.
    pub fn cfs_min_vruntime(&self) -> u64 {
        self.cfs.min_vruntime()
    }

    pub fn is_empty(&self) -> bool {
        self.nr_ready() == 0
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn cfs_entry(pid: Pid, vruntime: u64) -> QueueEntry {
        QueueEntry {
            pid,
            policy: SchedPolicy::Cfs,
            rt_priority: 0,
            vruntime,
            weight: 1024,
        }
    }

    #[test]
    fn cfs_pops_minimum_vruntime_with_pid_tiebreak() {
        let mut q = RunQueue::new();
        q.enqueue(cfs_entry(5, 300));
        q.enqueue(cfs_entry(2, 100));
        q.enqueue(cfs_entry(9, 100));
        assert_eq!(q.pick_next(), Some(2)); // lower pid wins the tie
        assert_eq!(q.pick_next(), Some(9));
        assert_eq!(q.pick_next(), Some(5));
        assert_eq!(q.pick_next(), None);
    }

    #[test]
    fn realtime_lane_beats_everything() {
        let mut q = RunQueue::new();
        q.enqueue(cfs_entry(1, 0));
        q.enqueue(QueueEntry {
            pid: 2,
            policy: SchedPolicy::RealTime,
            rt_priority: 10,
            vruntime: 0,
            weight: 1024,
        });
        q.enqueue(QueueEntry {
            pid: 3,
            policy: SchedPolicy::RealTime,
            rt_priority: 50,
            vruntime: 0,
            weight: 1024,
        });
        // Highest RT priority first, then the lower one, then CFS.
        assert_eq!(q.pick_next(), Some(3));
        assert_eq!(q.pick_next(), Some(2));
        assert_eq!(q.pick_next(), Some(1));
    }

    #[test]
    fn equal_rt_priority_is_fifo() {
        let mut q = RunQueue::new();
        for pid in [7, 3, 9] {
            q.enqueue(QueueEntry {
                pid,
                policy: SchedPolicy::RealTime,
                rt_priority: 20,
                vruntime: 0,
                weight: 1024,
            });
        }
        assert_eq!(q.pick_next(), Some(7));
        assert_eq!(q.pick_next(), Some(3));
        assert_eq!(q.pick_next(), Some(9));
    }

    #[test]
    fn idle_lane_runs_last() {
        let mut q = RunQueue::new();
        q.enqueue(QueueEntry {
            pid: 0,
            policy: SchedPolicy::Idle,
            rt_priority: 0,
            vruntime: 0,
            weight: 64,
        });
        q.enqueue(QueueEntry {
            pid: 4,
            policy: SchedPolicy::RoundRobin,
            rt_priority: 0,
            vruntime: 0,
            weight: 1024,
        });
        assert_eq!(q.pick_next(), Some(4));
        assert_eq!(q.pick_next(), Some(0));
    }

    #[test]
    fn sleep_clamp_prevents_vruntime_boost() {
        let mut q = RunQueue::new();
        q.enqueue(cfs_entry(1, 1_000_000));
        let (_, vrt, _) = {
            let mut lane = CfsLane::default();
            lane.min_vruntime = 500;
            lane.push(9, 100, 1024);
            lane.pop_min().unwrap()
        };
        // A woken process with an ancient vruntime is clamped up to the
        // queue minimum rather than monopolizing the CPU.
        assert_eq!(vrt, 500);
        let _ = q;
    }

    #[test]
    fn remove_detaches_and_updates_weight() {
        let mut q = RunQueue::new();
        q.enqueue(cfs_entry(1, 10));
        q.enqueue(cfs_entry(2, 20));
        assert_eq!(q.total_weight(), 2048);
        assert!(q.remove(1, SchedPolicy::Cfs, 10));
        assert_eq!(q.total_weight(), 1024);
        assert_eq!(q.nr_ready(), 1);
        assert!(!q.remove(1, SchedPolicy::Cfs, 10));
    }

    #[test]
    fn cfs_remove_falls_back_to_scan_on_stale_vruntime() {
        let mut q = RunQueue::new();
        q.enqueue(cfs_entry(1, 10));
        // Stale vruntime in the PCB still finds the entry.
        assert!(q.remove(1, SchedPolicy::Cfs, 999));
        assert!(q.is_empty());
    }

    #[test]
    fn pick_next_updates_total_weight() {
        let mut q = RunQueue::new();
        q.enqueue(cfs_entry(1, 0));
        q.enqueue(cfs_entry(2, 5));
        q.pick_next();
        assert_eq!(q.total_weight(), 1024);
        q.pick_next();
        assert_eq!(q.total_weight(), 0);
    }
}
