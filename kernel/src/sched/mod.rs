//! Preemptive scheduler.
//!
//! Per-CPU run queues with one FIFO lane per non-CFS policy and a CFS lane
//! ordered by virtual runtime. Selection order on every tick: RealTime by
//! priority, then CFS minimum vruntime, then RoundRobin, Batch, and Idle
//! lanes, then the idle loop.

pub mod load_balance;
pub mod queue;
pub mod scheduler;

pub use queue::RunQueue;
pub use scheduler::Scheduler;

/// Maximum CPUs the scheduler supports. The boot configuration uses one.
pub const MAX_CPUS: usize = 8;

/// Nanoseconds per timer tick (100 Hz).
pub const TICK_NS: u64 = 10_000_000;

/// Scheduling target latency: every ready process should run within this
/// window.
pub const TARGET_LATENCY_NS: u64 = 20_000_000;

/// Lower bound on any time slice.
pub const MIN_GRANULARITY_NS: u64 = 1_000_000;

/// vruntime surcharge applied to a migrated process so it is not
/// immediately rescheduled back.
pub const MIGRATION_COST_NS: u64 = 500_000;

/// Load-balance interval in milliseconds.
pub const BALANCE_INTERVAL_MS: u64 = 100;
