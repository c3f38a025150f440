//! Thread data model and lifecycle operations.
//!
//! A thread is a slot in the kernel registry addressed by a
//! generation-checked [`ThreadId`]; recycling a slot invalidates every
//! outstanding handle to its previous occupant, so lifecycle operations
//! on a stale handle fail with `InvalidState` instead of touching the
//! wrong thread.
//!
//! States are orthogonal flag bits. "Ready" is derived: a thread is
//! ready exactly when it has started and none of the blocking bits are
//! set, and the ready queue contains exactly the ready threads.

use crate::arch::{Arch, DefaultArch};
use crate::config::{HIGHEST_PRIO, LOWEST_PRIO};
use crate::error::{KernelError, KernelResult};
use crate::fatal::kassert;
use crate::irq::{irq_lock, irq_unlock};
use crate::sched::{reschedule, swap, Kernel};
use crate::time::ms_to_ticks;
use crate::wait_q::WaitQueue;
use core::ptr::NonNull;

#[cfg(feature = "semaphore-groups")]
use crate::sem::GroupWait;

/// Thread entry point; receives the three opaque arguments given at
/// spawn time.
pub type ThreadEntry = fn(usize, usize, usize);

/// Generation-checked handle to a thread registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    slot: u16,
    gen: u16,
}

impl ThreadId {
    pub(crate) fn from_raw(slot: u16, gen: u16) -> Self {
        ThreadId { slot, gen }
    }

    pub(crate) fn slot(self) -> u16 {
        self.slot
    }

    pub(crate) fn gen(self) -> u16 {
        self.gen
    }
}

/// State flag bits. `TIMING` is orthogonal to the rest: it marks an
/// armed timeout-list entry and clears independently.
pub(crate) mod flags {
    pub const STARTED: u8 = 1 << 0;
    pub const PENDING: u8 = 1 << 1;
    pub const TIMING: u8 = 1 << 2;
    pub const SUSPENDED: u8 = 1 << 3;
    pub const DEAD: u8 = 1 << 4;
    pub const ESSENTIAL: u8 = 1 << 5;
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Flags(u8);

impl Flags {
    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// Spawn-time options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Escalate an entry-function return to a fatal system error instead
    /// of a quiet abort.
    pub essential: bool,
    /// Thread-group membership mask for the bulk operations.
    pub groups: u32,
    /// Callback invoked at the start of an abort.
    pub abort_handler: Option<fn()>,
}

pub(crate) struct Thread {
    pub(crate) prio: i8,
    pub(crate) flags: Flags,
    pub(crate) entry: ThreadEntry,
    pub(crate) args: (usize, usize, usize),
    pub(crate) stack: &'static mut [u8],
    /// Wake value stashed by whoever unblocks this thread; reported by
    /// the swap that resumes it.
    pub(crate) swap_retval: KernelResult<()>,
    pub(crate) custom_data: usize,
    pub(crate) groups: u32,
    pub(crate) abort_handler: Option<fn()>,
    pub(crate) sched_locked: u32,
    /// Wait queue this thread is pended on, if any. Only valid while
    /// PENDING; only dereferenced under the interrupt lock. The queue
    /// lives inside a `'static` semaphore, so the pointer cannot dangle.
    pub(crate) pended_on: Option<NonNull<WaitQueue>>,
    #[cfg(feature = "semaphore-groups")]
    pub(crate) group_wait: Option<GroupWait>,
    pub(crate) ctx: <DefaultArch as Arch>::SavedContext,
}

impl Thread {
    pub(crate) fn new(
        stack: &'static mut [u8],
        entry: ThreadEntry,
        args: (usize, usize, usize),
        prio: i8,
        options: Options,
    ) -> Self {
        let mut flags = Flags::default();
        if options.essential {
            flags.set(flags::ESSENTIAL);
        }
        Thread {
            prio,
            flags,
            entry,
            args,
            stack,
            swap_retval: Ok(()),
            custom_data: 0,
            groups: options.groups,
            abort_handler: options.abort_handler,
            sched_locked: 0,
            pended_on: None,
            #[cfg(feature = "semaphore-groups")]
            group_wait: None,
            ctx: Default::default(),
        }
    }

    /// Prepare the saved context so the first switch-in enters the
    /// common trampoline on this thread's own stack.
    pub(crate) fn init_context(&mut self) {
        let Thread { ctx, stack, .. } = self;
        // Safety: the stack is exclusively owned by this thread
        unsafe { DefaultArch::init_context(ctx, stack, thread_entry) };
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.flags.has(flags::STARTED)
            && !self
                .flags
                .has(flags::PENDING | flags::TIMING | flags::SUSPENDED | flags::DEAD)
    }

    pub(crate) fn is_preemptible(&self) -> bool {
        self.prio >= 0 && self.sched_locked == 0
    }
}

/// Common entry point for every thread: run the user function with its
/// arguments, then tear the thread down if it returns. A thread marked
/// essential to system operation must never return; that is escalated
/// rather than recovered.
pub(crate) extern "C" fn thread_entry() -> ! {
    let (entry, args) = {
        let key = irq_lock();
        let kernel = unsafe { Kernel::get() };
        let t = kernel.current_thread();
        let info = (t.entry, t.args);
        irq_unlock(key);
        info
    };

    entry(args.0, args.1, args.2);

    let (me, essential) = {
        let key = irq_lock();
        let kernel = unsafe { Kernel::get() };
        let id = kernel.current();
        let essential = kernel.current_thread().flags.has(flags::ESSENTIAL);
        irq_unlock(key);
        (id, essential)
    };
    if essential {
        crate::fatal::oops("essential thread exited");
    }
    let _ = abort(me);

    // only reachable on ports that cannot switch away
    loop {
        core::hint::spin_loop();
    }
}

/// Create a thread on a caller-supplied stack. With `delay_ms == 0` the
/// thread starts immediately (and may preempt the caller); otherwise it
/// sits in the timing state and starts when the delay expires.
pub fn spawn(
    stack: &'static mut [u8],
    entry: ThreadEntry,
    args: (usize, usize, usize),
    prio: i8,
    options: Options,
    delay_ms: u32,
) -> KernelResult<ThreadId> {
    kassert!(!DefaultArch::in_isr(), "spawn from interrupt context");
    kassert!(
        (HIGHEST_PRIO..=LOWEST_PRIO).contains(&prio),
        "thread priority out of range"
    );

    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    kassert!(kernel.is_booted(), "spawn before boot");

    let mut thread = Thread::new(stack, entry, args, prio, options);
    thread.init_context();
    let id = match kernel.alloc_thread(thread) {
        Ok(id) => id,
        Err(e) => {
            irq_unlock(key);
            return Err(e);
        }
    };

    if delay_ms == 0 {
        start_one(kernel, id);
        if kernel.must_switch_threads() && !DefaultArch::in_isr() {
            let _ = unsafe { swap(key) };
        } else {
            irq_unlock(key);
        }
    } else {
        kernel.expect(id).flags.set(flags::TIMING);
        kernel.timeout_q.add(id, ms_to_ticks(delay_ms).max(1));
        irq_unlock(key);
    }

    Ok(id)
}

/// Tear down a thread whose delayed start has not come due yet. Any
/// other state is an invalid transition.
pub fn cancel(id: ThreadId) -> KernelResult<()> {
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };

    let cancellable = match kernel.tref(id) {
        Some(t) => !t.flags.has(flags::STARTED) && t.flags.has(flags::TIMING),
        None => false,
    };
    if !cancellable {
        irq_unlock(key);
        return Err(KernelError::InvalidState);
    }

    kernel.timeout_q.abort(id);
    kernel.expect(id).flags.set(flags::DEAD);
    kernel.release_thread(id);
    irq_unlock(key);
    Ok(())
}

/// Take a thread out of scheduling until [`resume`]. Suspending the
/// current thread switches away and does not return until resumed.
pub fn suspend(id: ThreadId) -> KernelResult<()> {
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    if kernel.tref(id).is_none() {
        irq_unlock(key);
        return Err(KernelError::InvalidState);
    }

    suspend_one(kernel, id);

    if id == kernel.current() {
        let _ = unsafe { swap(key) };
    } else {
        irq_unlock(key);
    }
    Ok(())
}

/// Make a suspended thread schedulable again.
pub fn resume(id: ThreadId) -> KernelResult<()> {
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    if kernel.tref(id).is_none() {
        irq_unlock(key);
        return Err(KernelError::InvalidState);
    }

    resume_one(kernel, id);
    reschedule(key);
    Ok(())
}

/// Permanently end a thread: run its abort handler, pull it out of
/// whatever queue holds it, mark it dead and free its slot. Aborting
/// the current thread never returns.
pub fn abort(id: ThreadId) -> KernelResult<()> {
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    if kernel.tref(id).is_none() {
        irq_unlock(key);
        return Err(KernelError::InvalidState);
    }

    abort_one(kernel, id);

    if kernel.is_booted() && id == kernel.current() {
        // never returns on a real port; the simulated port falls through
        let _ = unsafe { swap(key) };
        return Ok(());
    }
    irq_unlock(key);
    Ok(())
}

pub(crate) fn start_one(kernel: &mut Kernel, id: ThreadId) {
    kernel.expect(id).flags.set(flags::STARTED);
    kernel.ready_thread(id);
}

pub(crate) fn suspend_one(kernel: &mut Kernel, id: ThreadId) {
    let (ready, prio) = {
        let t = kernel.expect(id);
        (t.is_ready(), t.prio)
    };
    if ready {
        kernel.ready_q.remove(id, prio);
    }
    kernel.expect(id).flags.set(flags::SUSPENDED);
}

pub(crate) fn resume_one(kernel: &mut Kernel, id: ThreadId) {
    kernel.expect(id).flags.clear(flags::SUSPENDED);
    kernel.ready_thread(id);
}

pub(crate) fn abort_one(kernel: &mut Kernel, id: ThreadId) {
    let (handler, ready, prio) = {
        let t = kernel.expect(id);
        (t.abort_handler, t.is_ready(), t.prio)
    };
    if let Some(handler) = handler {
        handler();
    }

    if ready {
        kernel.ready_q.remove(id, prio);
    } else {
        if kernel.expect(id).flags.has(flags::PENDING) {
            kernel.unpend(id);
        }
        if kernel.expect(id).flags.has(flags::TIMING) {
            kernel.timeout_q.abort(id);
            kernel.expect(id).flags.clear(flags::TIMING);
        }
    }
    #[cfg(feature = "semaphore-groups")]
    crate::sem::teardown_group(kernel, id);

    kernel.expect(id).flags.set(flags::DEAD);
    kernel.release_thread(id);
}

/// Apply one lifecycle transition to every thread whose group mask
/// intersects `mask`, atomically with respect to preemption: the
/// scheduler stays latched for the sweep and a single reschedule runs at
/// the end.
fn group_op(mask: u32, op: fn(&mut Kernel, ThreadId)) {
    kassert!(!DefaultArch::in_isr(), "group operation from interrupt context");
    crate::sched::sched_lock();

    let mut slot = 0;
    loop {
        let key = irq_lock();
        let kernel = unsafe { Kernel::get() };
        match kernel.thread_in_group(slot, mask) {
            Some(id) => op(kernel, id),
            None => {}
        }
        irq_unlock(key);
        slot += 1;
        if slot >= crate::config::MAX_THREADS {
            break;
        }
    }

    crate::sched::sched_unlock();
}

pub fn group_start(mask: u32) {
    group_op(mask, start_one);
}

pub fn group_suspend(mask: u32) {
    group_op(mask, suspend_one);
}

pub fn group_resume(mask: u32) {
    group_op(mask, resume_one);
}

pub fn group_abort(mask: u32) {
    group_op(mask, abort_one);
}

/// Add group memberships to a thread.
pub fn group_join(id: ThreadId, mask: u32) -> KernelResult<()> {
    with_thread(id, |t| t.groups |= mask)
}

/// Drop group memberships from a thread.
pub fn group_leave(id: ThreadId, mask: u32) -> KernelResult<()> {
    with_thread(id, |t| t.groups &= !mask)
}

/// Attach an opaque word to a thread; the kernel never interprets it.
pub fn custom_data_set(id: ThreadId, data: usize) -> KernelResult<()> {
    with_thread(id, |t| t.custom_data = data)
}

pub fn custom_data_get(id: ThreadId) -> KernelResult<usize> {
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    let out = kernel.tref(id).map(|t| t.custom_data);
    irq_unlock(key);
    out.ok_or(KernelError::InvalidState)
}

/// Mark the current thread essential to system operation: an entry
/// return (or comparable failure) becomes a fatal system error.
pub fn set_essential() {
    let key = irq_lock();
    unsafe { Kernel::get() }.current_thread().flags.set(flags::ESSENTIAL);
    irq_unlock(key);
}

pub fn clear_essential() {
    let key = irq_lock();
    unsafe { Kernel::get() }.current_thread().flags.clear(flags::ESSENTIAL);
    irq_unlock(key);
}

pub fn is_essential() -> bool {
    let key = irq_lock();
    let out = unsafe { Kernel::get() }.current_thread().flags.has(flags::ESSENTIAL);
    irq_unlock(key);
    out
}

/// Handle of the currently executing thread.
pub fn current() -> ThreadId {
    let key = irq_lock();
    let id = unsafe { Kernel::get() }.current();
    irq_unlock(key);
    id
}

/// Whether execution is in interrupt context.
pub fn is_in_isr() -> bool {
    DefaultArch::in_isr()
}

pub fn priority_get(id: ThreadId) -> KernelResult<i8> {
    let key = irq_lock();
    let out = unsafe { Kernel::get() }.tref(id).map(|t| t.prio);
    irq_unlock(key);
    out.ok_or(KernelError::InvalidState)
}

/// Change a thread's priority; repositions it in the ready queue and
/// reschedules.
pub fn priority_set(id: ThreadId, prio: i8) -> KernelResult<()> {
    kassert!(!DefaultArch::in_isr(), "priority change from interrupt context");
    kassert!(
        (HIGHEST_PRIO..=LOWEST_PRIO).contains(&prio),
        "thread priority out of range"
    );

    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    let (ready, old) = match kernel.tref(id) {
        Some(t) => (t.is_ready(), t.prio),
        None => {
            irq_unlock(key);
            return Err(KernelError::InvalidState);
        }
    };

    if ready {
        kernel.ready_q.remove(id, old);
    }
    kernel.expect(id).prio = prio;
    if ready {
        kernel.ready_q.add(id, prio);
    }
    reschedule(key);
    Ok(())
}

/// Snapshot of a thread's scheduling state, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct ThreadInfo {
    pub priority: i8,
    pub started: bool,
    pub ready: bool,
    pub pending: bool,
    pub suspended: bool,
    pub timing: bool,
    pub essential: bool,
    pub groups: u32,
}

/// Inspect a live thread; `None` for dead threads and stale handles.
pub fn info(id: ThreadId) -> Option<ThreadInfo> {
    let key = irq_lock();
    let out = unsafe { Kernel::get() }.tref(id).map(|t| ThreadInfo {
        priority: t.prio,
        started: t.flags.has(flags::STARTED),
        ready: t.is_ready(),
        pending: t.flags.has(flags::PENDING),
        suspended: t.flags.has(flags::SUSPENDED),
        timing: t.flags.has(flags::TIMING),
        essential: t.flags.has(flags::ESSENTIAL),
        groups: t.groups,
    });
    irq_unlock(key);
    out
}

fn with_thread(id: ThreadId, f: impl FnOnce(&mut Thread)) -> KernelResult<()> {
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    let out = match kernel.tmut(id) {
        Some(t) => {
            f(t);
            Ok(())
        }
        None => Err(KernelError::InvalidState),
    };
    irq_unlock(key);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::*;
    use crate::time::sys_clock_announce;

    fn noop(_a: usize, _b: usize, _c: usize) {}

    #[test]
    fn delayed_spawn_starts_on_expiry() {
        let (_guard, _main) = booted_kernel();

        let t = spawn(leaked_stack(), noop, (0, 0, 0), 7, Options::default(), 30).unwrap();

        let snap = info(t).unwrap();
        assert!(!snap.started);
        assert!(snap.timing);
        assert!(!snap.ready);

        sys_clock_announce(ms_to_ticks(30));

        let snap = info(t).unwrap();
        assert!(snap.started);
        assert!(!snap.timing);
        assert!(snap.ready);
    }

    #[test]
    fn cancel_only_before_start() {
        let (_guard, _main) = booted_kernel();

        let delayed = spawn(leaked_stack(), noop, (0, 0, 0), 7, Options::default(), 50).unwrap();
        let started = spawn(leaked_stack(), noop, (0, 0, 0), 7, Options::default(), 0).unwrap();

        assert_eq!(cancel(started), Err(KernelError::InvalidState));
        assert_eq!(cancel(delayed), Ok(()));
        assert!(info(delayed).is_none());
        // timeout is gone with the thread
        sys_clock_announce(ms_to_ticks(50));
        assert!(info(delayed).is_none());

        assert_eq!(cancel(delayed), Err(KernelError::InvalidState));
    }

    #[test]
    fn suspend_resume_round_trip_preserves_priority() {
        let (_guard, _main) = booted_kernel();

        let t = spawn(leaked_stack(), noop, (0, 0, 0), 9, Options::default(), 0).unwrap();
        let kernel = unsafe { Kernel::get() };
        assert!(kernel.ready_q.contains(t, 9));

        suspend(t).unwrap();
        let kernel = unsafe { Kernel::get() };
        assert!(!kernel.ready_q.contains(t, 9));
        assert!(info(t).unwrap().suspended);

        resume(t).unwrap();
        let kernel = unsafe { Kernel::get() };
        assert!(kernel.ready_q.contains(t, 9));
        assert_eq!(info(t).unwrap().priority, 9);
        assert!(!info(t).unwrap().suspended);
    }

    #[test]
    fn abort_invalidates_the_handle() {
        let (_guard, _main) = booted_kernel();

        let t = spawn(leaked_stack(), noop, (0, 0, 0), 9, Options::default(), 0).unwrap();
        assert_eq!(abort(t), Ok(()));
        assert!(info(t).is_none());
        // a second abort is an ordinary error, not corruption
        assert_eq!(abort(t), Err(KernelError::InvalidState));
        assert_eq!(suspend(t), Err(KernelError::InvalidState));
    }

    #[test]
    fn abort_runs_the_handler() {
        use portable_atomic::{AtomicUsize, Ordering};
        static RAN: AtomicUsize = AtomicUsize::new(0);
        fn on_abort() {
            RAN.fetch_add(1, Ordering::Relaxed);
        }

        let (_guard, _main) = booted_kernel();
        RAN.store(0, Ordering::Relaxed);

        let t = spawn(
            leaked_stack(),
            noop,
            (0, 0, 0),
            9,
            Options {
                abort_handler: Some(on_abort),
                ..Options::default()
            },
            0,
        )
        .unwrap();

        abort(t).unwrap();
        assert_eq!(RAN.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn slot_reuse_rejects_stale_handles() {
        let (_guard, _main) = booted_kernel();

        let first = spawn(leaked_stack(), noop, (0, 0, 0), 9, Options::default(), 0).unwrap();
        abort(first).unwrap();

        // same slot, new generation
        let second = spawn(leaked_stack(), noop, (0, 0, 0), 9, Options::default(), 0).unwrap();
        assert_ne!(first, second);
        assert!(info(first).is_none());
        assert!(info(second).is_some());
        assert_eq!(custom_data_set(first, 1), Err(KernelError::InvalidState));
    }

    #[test]
    fn group_ops_touch_only_members() {
        let (_guard, _main) = booted_kernel();

        let in_a = spawn(
            leaked_stack(),
            noop,
            (0, 0, 0),
            8,
            Options {
                groups: 0x1,
                ..Options::default()
            },
            0,
        )
        .unwrap();
        let in_b = spawn(
            leaked_stack(),
            noop,
            (0, 0, 0),
            8,
            Options {
                groups: 0x2,
                ..Options::default()
            },
            0,
        )
        .unwrap();

        group_suspend(0x1);
        assert!(info(in_a).unwrap().suspended);
        assert!(!info(in_b).unwrap().suspended);

        group_resume(0x1);
        assert!(!info(in_a).unwrap().suspended);

        group_join(in_b, 0x4).unwrap();
        assert_eq!(info(in_b).unwrap().groups, 0x6);
        group_abort(0x4);
        assert!(info(in_b).is_none());
        assert!(info(in_a).is_some());
    }

    #[test]
    fn custom_data_round_trips() {
        let (_guard, _main) = booted_kernel();

        let t = spawn(leaked_stack(), noop, (0, 0, 0), 9, Options::default(), 0).unwrap();
        assert_eq!(custom_data_get(t), Ok(0));
        custom_data_set(t, 0xC0FFEE).unwrap();
        assert_eq!(custom_data_get(t), Ok(0xC0FFEE));
    }

    #[test]
    fn essential_marks_the_current_thread() {
        let (_guard, main) = booted_kernel();

        assert!(!is_essential());
        set_essential();
        assert!(is_essential());
        assert!(info(main).unwrap().essential);
        clear_essential();
        assert!(!is_essential());
    }

    #[test]
    fn priority_set_repositions_in_ready_queue() {
        let (_guard, _main) = booted_kernel();

        let t = spawn(leaked_stack(), noop, (0, 0, 0), 9, Options::default(), 0).unwrap();
        priority_set(t, 4).unwrap();

        let kernel = unsafe { Kernel::get() };
        assert!(kernel.ready_q.contains(t, 4));
        assert!(!kernel.ready_q.contains(t, 9));
        assert_eq!(priority_get(t), Ok(4));
    }
}
