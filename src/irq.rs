//! The interrupt lock.
//!
//! Disabling interrupts is the kernel's sole mutual-exclusion mechanism:
//! on a single core the only concurrency is between thread context and
//! interrupt context, and masking interrupts excludes both. Every
//! mutation of the ready queue, a wait queue, the timeout list or thread
//! state happens between [`irq_lock`] and [`irq_unlock`]. Critical
//! sections must stay short; the mask also holds off the system clock.

use crate::arch::{Arch, DefaultArch};

/// Proof that the interrupt lock is held, carrying the mask state to
/// restore. Nesting works by saving and restoring the previous state:
/// only the outermost unlock re-enables interrupts.
#[must_use]
pub struct IrqKey {
    was_enabled: bool,
}

/// Lock out interrupts and return the restore token.
pub fn irq_lock() -> IrqKey {
    let was_enabled = DefaultArch::interrupts_enabled();
    DefaultArch::disable_interrupts();
    IrqKey { was_enabled }
}

/// Restore the interrupt mask saved in `key`.
pub fn irq_unlock(key: IrqKey) {
    if key.was_enabled {
        DefaultArch::enable_interrupts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_nests_via_tokens() {
        // serializes against every other test touching the simulated mask
        let _guard = crate::sched::test_support::fresh_kernel();
        assert!(DefaultArch::interrupts_enabled());

        let outer = irq_lock();
        assert!(!DefaultArch::interrupts_enabled());

        let inner = irq_lock();
        assert!(!DefaultArch::interrupts_enabled());

        irq_unlock(inner);
        // inner restore must not re-enable: outer still holds the lock
        assert!(!DefaultArch::interrupts_enabled());

        irq_unlock(outer);
        assert!(DefaultArch::interrupts_enabled());
    }
}
