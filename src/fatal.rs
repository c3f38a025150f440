//! Fatal error escalation.
//!
//! Contract violations (blocking from interrupt context, a zero-limit
//! semaphore, an empty semaphore group) are never returned to the caller:
//! continuing would corrupt the ready queue, which is worse than a hard
//! stop. The failure is pushed through the registered diagnostics sink
//! first so it is visible, then the system halts.

use spin::Once;

/// Diagnostics sink invoked with the failure message before halting.
pub type FatalHook = fn(&str);

static FATAL_HOOK: Once<FatalHook> = Once::new();

/// Install the diagnostics sink. May be called once, typically at boot,
/// before interrupts are enabled; later calls are ignored.
pub fn set_fatal_hook(hook: FatalHook) {
    FATAL_HOOK.call_once(|| hook);
}

/// Report a fatal kernel error and halt.
pub fn oops(msg: &'static str) -> ! {
    if let Some(hook) = FATAL_HOOK.get() {
        hook(msg);
    }
    panic!("fatal kernel error: {}", msg);
}

/// Assert a kernel invariant; violation is a fatal error, in debug and
/// release builds alike.
macro_rules! kassert {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            $crate::fatal::oops($msg);
        }
    };
}

pub(crate) use kassert;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "fatal kernel error")]
    fn oops_panics() {
        oops("test failure");
    }

    #[test]
    fn assert_passes_quietly() {
        kassert!(1 + 1 == 2, "arithmetic broke");
    }
}
