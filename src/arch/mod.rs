//! Architecture abstraction for interrupt masking and context switching.
//!
//! Everything the scheduler needs from the hardware goes through the
//! [`Arch`] trait: the interrupt mask (the kernel's one and only mutual
//! exclusion mechanism), interrupt-context detection, a cycle counter for
//! busy-waiting, and the context save/restore pair behind the swap
//! operation. Real ports implement this with inline assembly; [`SimArch`]
//! provides a bookkeeping-only implementation for hosted builds and
//! tests.

use portable_atomic::{AtomicU32, Ordering};

/// Interrupt nesting depth, maintained by the port's interrupt entry and
/// exit stubs via [`isr_enter`]/[`isr_exit`].
static ISR_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Record entry into an interrupt handler.
pub fn isr_enter() {
    ISR_DEPTH.fetch_add(1, Ordering::Relaxed);
}

/// Record exit from an interrupt handler.
pub fn isr_exit() {
    ISR_DEPTH.fetch_sub(1, Ordering::Relaxed);
}

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations manipulate the interrupt mask and raw execution
/// contexts. The unsafe methods have preconditions the scheduler upholds;
/// see each method.
pub trait Arch {
    /// Saved execution context of a suspended thread.
    type SavedContext: Default;

    /// Disable interrupt delivery on the current CPU.
    fn disable_interrupts();

    /// Enable interrupt delivery on the current CPU.
    fn enable_interrupts();

    /// Whether interrupts are currently enabled.
    fn interrupts_enabled() -> bool;

    /// Whether the current execution context is an interrupt handler.
    fn in_isr() -> bool {
        ISR_DEPTH.load(Ordering::Relaxed) > 0
    }

    /// Free-running cycle counter used by the busy-wait primitive.
    fn cycle_count() -> u32;

    /// Cycle counter frequency.
    fn cycles_per_sec() -> u32;

    /// Prepare a fresh context so that switching to it enters `entry` on
    /// the given stack.
    ///
    /// # Safety
    ///
    /// `stack` must be the thread's exclusively-owned stack region and
    /// must remain valid until the thread is dead.
    unsafe fn init_context(ctx: &mut Self::SavedContext, stack: &mut [u8], entry: extern "C" fn() -> !);

    /// Save the current context into `prev` and resume execution from
    /// `next`.
    ///
    /// # Safety
    ///
    /// Must be called with interrupts locked. Both pointers must be valid
    /// and `next` must hold a context prepared by [`Arch::init_context`]
    /// or a previous switch-out.
    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext);
}

/// Bookkeeping-only port for hosted builds and tests.
///
/// The interrupt mask and cycle counter are simulated with atomics and
/// `context_switch` is a no-op: the scheduler's queue and state
/// transitions all happen for real, but execution stays on the caller's
/// stack. Combined with [`SimArch::enter_isr`] this is enough to exercise
/// every locking and preemption rule on a development host.
pub struct SimArch;

static SIM_INTS_ENABLED: AtomicU32 = AtomicU32::new(1);
static SIM_CYCLES: AtomicU32 = AtomicU32::new(0);

impl SimArch {
    /// Simulate entering an interrupt handler.
    pub fn enter_isr() {
        isr_enter();
    }

    /// Simulate leaving an interrupt handler.
    pub fn exit_isr() {
        isr_exit();
    }

    #[cfg(test)]
    pub(crate) fn reset() {
        SIM_INTS_ENABLED.store(1, Ordering::Relaxed);
        while ISR_DEPTH.load(Ordering::Relaxed) > 0 {
            isr_exit();
        }
    }
}

/// Simulated context; carries no state.
#[derive(Default)]
pub struct SimContext;

impl Arch for SimArch {
    type SavedContext = SimContext;

    fn disable_interrupts() {
        SIM_INTS_ENABLED.store(0, Ordering::Relaxed);
    }

    fn enable_interrupts() {
        SIM_INTS_ENABLED.store(1, Ordering::Relaxed);
    }

    fn interrupts_enabled() -> bool {
        SIM_INTS_ENABLED.load(Ordering::Relaxed) != 0
    }

    fn cycle_count() -> u32 {
        // advances on every read so busy-wait loops terminate
        SIM_CYCLES.fetch_add(1, Ordering::Relaxed)
    }

    fn cycles_per_sec() -> u32 {
        1_000_000
    }

    unsafe fn init_context(_ctx: &mut SimContext, _stack: &mut [u8], _entry: extern "C" fn() -> !) {}

    unsafe fn context_switch(_prev: *mut SimContext, _next: *const SimContext) {}
}

#[cfg(all(target_arch = "x86_64", feature = "x86_64"))]
pub mod x86_64;

#[cfg(all(target_arch = "x86_64", feature = "x86_64"))]
pub use x86_64::X86_64Arch as DefaultArch;

#[cfg(not(all(target_arch = "x86_64", feature = "x86_64")))]
pub use SimArch as DefaultArch;
