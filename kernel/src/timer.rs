//! Timer subsystem.
//!
//! The PIT raises IRQ0 at [`TICK_HZ`]; the handler advances the global
//! tick counter and this module's software timers, then drives the
//! scheduler. Software timers are one-shot or periodic callbacks with
//! millisecond granularity, held in a fixed-size pool so the timer path
//! never allocates.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Timer tick rate programmed into the PIT.
pub const TICK_HZ: u64 = 100;

/// Milliseconds per tick.
pub const TICK_MS: u64 = 1000 / TICK_HZ;

/// Maximum number of software timers active at once.
const MAX_TIMERS: usize = 64;

/// Monotonic tick counter since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonically increasing counter for unique timer IDs.
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Global software-timer pool.
static TIMER_WHEEL: Mutex<TimerWheel> = Mutex::new(TimerWheel::new());

/// Unique identifier for a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub u64);

impl TimerId {
    fn next() -> Self {
        Self(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Timer firing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire once after the interval elapses, then auto-deactivate.
    OneShot,
    /// Fire repeatedly at the given interval until cancelled.
    Periodic,
}

/// Timer callbacks are plain function pointers so they can live in static
/// data without allocation. The firing timer's ID is passed in.
pub type TimerCallback = fn(TimerId);

#[derive(Debug, Clone, Copy)]
struct Timer {
    id: TimerId,
    mode: TimerMode,
    interval_ms: u64,
    remaining_ms: u64,
    callback: TimerCallback,
}

/// Fixed-pool software timer wheel.
struct TimerWheel {
    timers: [Option<Timer>; MAX_TIMERS],
    active_count: usize,
}

impl TimerWheel {
    const fn new() -> Self {
        const NONE_TIMER: Option<Timer> = None;
        Self {
            timers: [NONE_TIMER; MAX_TIMERS],
            active_count: 0,
        }
    }

    fn add_timer(
        &mut self,
        mode: TimerMode,
        interval_ms: u64,
        callback: TimerCallback,
    ) -> KernelResult<TimerId> {
        if interval_ms == 0 {
            return Err(KernelError::Invalid {
                what: "zero timer interval",
            });
        }
        let slot = self
            .timers
            .iter()
            .position(|t| t.is_none())
            .ok_or(KernelError::OutOfMemory {
                requested: core::mem::size_of::<Timer>(),
            })?;

        let id = TimerId::next();
        self.timers[slot] = Some(Timer {
            id,
            mode,
            interval_ms,
            remaining_ms: interval_ms,
            callback,
        });
        self.active_count += 1;
        Ok(id)
    }

    fn cancel_timer(&mut self, id: TimerId) -> KernelResult<()> {
        for entry in self.timers.iter_mut() {
            if entry.is_some_and(|t| t.id == id) {
                *entry = None;
                self.active_count -= 1;
                return Ok(());
            }
        }
        Err(KernelError::NotFound { resource: "timer" })
    }

    /// Advance all timers by `elapsed_ms`, collecting expired callbacks.
    /// Callbacks are invoked by the caller after the wheel lock drops.
    fn tick(&mut self, elapsed_ms: u64, fired: &mut [(TimerId, TimerCallback)]) -> usize {
        let mut fired_count = 0usize;

        for entry in self.timers.iter_mut() {
            let Some(timer) = entry else { continue };

            if timer.remaining_ms <= elapsed_ms {
                if fired_count < fired.len() {
                    fired[fired_count] = (timer.id, timer.callback);
                    fired_count += 1;
                }
                match timer.mode {
                    TimerMode::OneShot => {
                        *entry = None;
                        self.active_count -= 1;
                    }
                    TimerMode::Periodic => {
                        let overshoot = elapsed_ms.saturating_sub(timer.remaining_ms);
                        timer.remaining_ms = timer
                            .interval_ms
                            .saturating_sub(overshoot % timer.interval_ms)
                            .max(1);
                    }
                }
            } else {
                timer.remaining_ms -= elapsed_ms;
            }
        }

        fired_count
    }

    fn pending_count(&self) -> usize {
        self.active_count
    }
}

fn noop_callback(_id: TimerId) {}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Advance the kernel clock by one tick and fire due software timers.
/// Called from the timer IRQ handler. Returns the new tick count.
pub fn on_tick() -> u64 {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    let mut fired: [(TimerId, TimerCallback); 16] = [(TimerId(0), noop_callback); 16];
    let count = TIMER_WHEEL.lock().tick(TICK_MS, &mut fired);
    // Fire outside the wheel lock so callbacks may register timers.
    for &(id, cb) in fired.iter().take(count) {
        cb(id);
    }
    now
}

/// Current tick count. Monotonic: two successive reads satisfy t2 >= t1.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    get_ticks() * TICK_MS
}

/// Whole seconds since boot, used for inode timestamps.
pub fn timestamp_secs() -> u64 {
    uptime_ms() / 1000
}

/// Register a software timer.
pub fn create_timer(
    mode: TimerMode,
    interval_ms: u64,
    callback: TimerCallback,
) -> KernelResult<TimerId> {
    TIMER_WHEEL.lock().add_timer(mode, interval_ms, callback)
}

/// Cancel an active software timer.
pub fn cancel_timer(id: TimerId) -> KernelResult<()> {
    TIMER_WHEEL.lock().cancel_timer(id)
}

/// Number of currently pending software timers.
pub fn pending_timer_count() -> usize {
    TIMER_WHEEL.lock().pending_count()
}
