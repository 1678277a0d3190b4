//! Compile-time tuning of the scheduler and the SMP bring-up. These values
//! are part of the kernel's observable behavior and are referenced by the
//! test suite; change them deliberately.

/// Number of scheduling classes.
pub const SCHED_CLASSES: usize = 5;

/// Priority levels per scheduling class.
pub const PRIORITY_LEVELS: usize = 32;

/// Default time slice of a freshly dispatched thread, in timer ticks.
pub const DEFAULT_TIMESLICE_TICKS: u32 = 31;

/// Scheduler tick rate of the local APIC timer.
pub const TIMER_FREQUENCY_HZ: u32 = 100;

/// Nanoseconds per scheduler tick.
pub const TICK_PERIOD_NS: u64 = 1_000_000_000 / TIMER_FREQUENCY_HZ as u64;

/// A balancing pass is requested every this many ticks.
pub const LOAD_BALANCE_INTERVAL_TICKS: u64 = 100;

/// An idle CPU tries to pull work every this many ticks.
pub const IDLE_BALANCE_INTERVAL_TICKS: u64 = 1;

/// A queue must exceed the puller's length by more than this many threads
/// before a migration is considered.
pub const IMBALANCE_THRESHOLD: u32 = 1;

/// Threads that ran within this window count as cache-hot and are not
/// migrated by the periodic balancer.
pub const CACHE_HOT_NS: u64 = 1_000_000;

/// How long the bootstrap processor waits for an application processor to
/// signal readiness before giving up on it.
pub const AP_STARTUP_TIMEOUT_US: u64 = 1_000_000;

#[allow(dead_code)]
pub const KERNEL_STACK_SIZE: usize = 0x4000;

#[allow(dead_code)]
pub const DEFAULT_STACK_SIZE: usize = 0x10000;
