#![no_std]

//! A no_std real-time nanokernel core: preemptive priority scheduling,
//! counting semaphores and semaphore groups for OS kernels and embedded
//! systems.
//!
//! The kernel is a process-wide singleton initialized once with
//! [`boot`]. Threads run on caller-supplied stacks, are addressed by
//! generation-checked handles, and block only on the counting
//! [`Semaphore`] primitive; interrupt masking is the sole mutual
//! exclusion mechanism. The application's panic handler (or a fatal hook
//! installed via [`set_fatal_hook`]) decides how a fatal kernel error is
//! surfaced before the halt.

pub mod arch;
pub mod config;
pub mod error;
pub mod fatal;
pub mod irq;
pub mod sched;
pub mod sem;
pub mod thread;
pub mod time;

mod timeout;
mod wait_q;

#[cfg(test)]
extern crate std;

/// Scheduler-path trace macro; compiles away without the `defmt`
/// feature.
macro_rules! k_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        ::defmt::trace!($($arg)*);
    }};
}

pub(crate) use k_debug;

pub use error::{KernelError, KernelResult};
pub use fatal::set_fatal_hook;
pub use irq::{irq_lock, irq_unlock, IrqKey};
pub use sched::{boot, sched_lock, sched_unlock, sleep, wakeup, yield_now};
pub use sem::Semaphore;
pub use thread::{Options, ThreadEntry, ThreadId, ThreadInfo};
pub use time::{busy_wait, sys_clock_announce, uptime_ticks, Timeout};

#[cfg(feature = "semaphore-groups")]
pub use sem::{group_give, group_reset, group_take};
