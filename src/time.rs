//! System clock: tick accounting, timeout conversion and busy-waiting.

use crate::arch::{Arch, DefaultArch};
use crate::config::TICKS_PER_SEC;
use crate::irq::irq_lock;
use crate::sched::{reschedule, Kernel};
use portable_atomic::{AtomicU64, Ordering};

const USEC_PER_SEC: u64 = 1_000_000;
const MSEC_PER_SEC: u64 = 1_000;

/// How long a blocking operation is willing to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail immediately instead of pending, even if others are waiting.
    NoWait,
    /// Pend for at most this many milliseconds.
    Millis(u32),
    /// Pend until explicitly released or aborted.
    Forever,
}

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks announced since boot.
pub fn uptime_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Convert milliseconds to ticks, rounding up.
pub fn ms_to_ticks(ms: u32) -> u32 {
    let ms_ticks_per_sec = ms as u64 * TICKS_PER_SEC as u64;
    ms_ticks_per_sec.div_ceil(MSEC_PER_SEC) as u32
}

/// Announce elapsed clock ticks: expire due timeouts (starting delayed
/// threads and unblocking timed-out waiters) and reschedule. Normally
/// called with `1` from the clock interrupt handler; an interrupt-context
/// caller only marks threads ready, the switch happens at the next
/// thread-context reschedule point.
pub fn sys_clock_announce(ticks: u32) {
    TICKS.fetch_add(ticks as u64, Ordering::Relaxed);

    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    for _ in 0..ticks {
        let expired = kernel.timeout_q.tick();
        for id in expired.iter() {
            kernel.expire(id);
        }
    }
    reschedule(key);
}

/// Spin for `usec_to_wait` microseconds without yielding the CPU; for
/// drivers that need short hardware-timing pauses while the scheduler
/// keeps running.
pub fn busy_wait(usec_to_wait: u32) {
    // 64-bit math to prevent overflow in the multiply
    let cycles_to_wait =
        ((usec_to_wait as u64 * DefaultArch::cycles_per_sec() as u64) / USEC_PER_SEC) as u32;
    let start_cycles = DefaultArch::cycle_count();

    loop {
        let current_cycles = DefaultArch::cycle_count();

        // wrapping subtraction handles rollover of the 32-bit counter
        if current_cycles.wrapping_sub(start_cycles) >= cycles_to_wait {
            break;
        }
    }
}

/// SIGALRM-driven tick source for exercising the kernel on a Linux host:
/// the interval timer stands in for the periodic clock interrupt.
#[cfg(all(target_os = "linux", feature = "hosted-tick"))]
pub mod hosted {
    use crate::arch;
    use crate::config::TICKS_PER_SEC;

    extern "C" fn on_alarm(_sig: libc::c_int) {
        arch::isr_enter();
        super::sys_clock_announce(1);
        arch::isr_exit();
    }

    /// Arm the interval timer at the system tick rate.
    ///
    /// # Safety
    ///
    /// Takes over SIGALRM and ITIMER_REAL for the whole process; no
    /// other code may rely on either while the tick source runs.
    pub unsafe fn start() {
        libc::signal(libc::SIGALRM, on_alarm as usize);

        let period_us = (1_000_000 / TICKS_PER_SEC) as libc::suseconds_t;
        let timer = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: period_us,
            },
            it_value: libc::timeval {
                tv_sec: 0,
                tv_usec: period_us,
            },
        };
        libc::setitimer(libc::ITIMER_REAL, &timer, core::ptr::null_mut());
    }

    /// Disarm the tick source.
    ///
    /// # Safety
    ///
    /// See [`start`].
    pub unsafe fn stop() {
        let timer = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            it_value: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        libc::setitimer(libc::ITIMER_REAL, &timer, core::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_to_ticks_rounds_up() {
        // 100 Hz clock: one tick per 10 ms
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(15), 2);
        assert_eq!(ms_to_ticks(20), 2);
        assert_eq!(ms_to_ticks(1000), TICKS_PER_SEC);
    }

    #[test]
    fn busy_wait_returns() {
        // the simulated cycle counter advances on every read
        busy_wait(50);
    }

    #[test]
    fn announce_advances_uptime() {
        let _guard = crate::sched::test_support::fresh_kernel();
        let before = uptime_ticks();
        sys_clock_announce(3);
        assert_eq!(uptime_ticks(), before + 3);
    }
}
