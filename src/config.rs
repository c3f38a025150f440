//! Compile-time kernel configuration.
//!
//! Capacities are fixed at build time; there is no allocator. Sizing a
//! deployment means editing these constants and rebuilding, the same way
//! the reference configuration headers work on static RTOS builds.

/// Maximum number of live threads, including the main and idle threads.
pub const MAX_THREADS: usize = 32;

/// Number of cooperative (negative, non-preemptible) priority levels.
pub const NUM_COOP_PRIORITIES: i8 = 16;

/// Number of preemptible (non-negative) priority levels.
pub const NUM_PREEMPT_PRIORITIES: i8 = 16;

/// Total priority levels; one ready-queue list per level.
pub const NUM_PRIORITIES: usize = (NUM_COOP_PRIORITIES + NUM_PREEMPT_PRIORITIES) as usize;

/// Highest (numerically smallest) legal priority.
pub const HIGHEST_PRIO: i8 = -NUM_COOP_PRIORITIES;

/// Lowest legal priority; reserved for the idle thread.
pub const LOWEST_PRIO: i8 = NUM_PREEMPT_PRIORITIES - 1;

/// Default priority of the main (boot) thread.
pub const MAIN_PRIO: i8 = 0;

/// Capacity of a single wait queue. Every thread plus every group-wait
/// proxy could in principle pend on one semaphore.
pub const WAIT_QUEUE_CAPACITY: usize = MAX_THREADS + MAX_WAIT_PROXIES;

/// Maximum semaphores in one group-wait call.
pub const MAX_GROUP_SIZE: usize = 8;

/// Process-wide pool of group-wait proxy nodes.
pub const MAX_WAIT_PROXIES: usize = 16;

/// Maximum armed timeouts. One per thread is enough: proxies do not carry
/// their own timeouts (see sem.rs).
pub const MAX_TIMEOUTS: usize = MAX_THREADS;

/// System clock tick rate.
pub const TICKS_PER_SEC: u32 = 100;
