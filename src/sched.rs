//! Scheduler core: the process-wide kernel context, the priority ready
//! queue, pend/unpend bookkeeping, and the context-switch trigger.
//!
//! There is exactly one [`Kernel`], created at link time and initialized
//! once by [`boot`]. Every mutation happens with the interrupt lock held;
//! the only operation that suspends while holding it is [`swap`], which
//! hands the lock's restore token to the switched-in thread.

use crate::arch::{Arch, DefaultArch};
use crate::config::{
    LOWEST_PRIO, MAIN_PRIO, MAX_THREADS, NUM_COOP_PRIORITIES, NUM_PRIORITIES,
};
use crate::error::{KernelError, KernelResult};
use crate::fatal::kassert;
use crate::irq::{irq_lock, irq_unlock, IrqKey};
use crate::k_debug;
use crate::thread::{flags, Options, Thread, ThreadId};
use crate::time::{ms_to_ticks, Timeout};
use crate::timeout::TimeoutList;
use crate::wait_q::{WaitQueue, Waiter};
use core::cell::UnsafeCell;
use core::ptr::NonNull;

#[cfg(feature = "semaphore-groups")]
use crate::sem::ProxyPool;

fn prio_index(prio: i8) -> usize {
    (prio + NUM_COOP_PRIORITIES) as usize
}

/// FIFO list of thread handles at one priority level.
struct PrioList {
    items: [Option<ThreadId>; MAX_THREADS],
    len: usize,
}

impl PrioList {
    const fn new() -> Self {
        PrioList {
            items: [None; MAX_THREADS],
            len: 0,
        }
    }

    fn push_back(&mut self, id: ThreadId) {
        kassert!(self.len < MAX_THREADS, "ready queue overflow");
        self.items[self.len] = Some(id);
        self.len += 1;
    }

    fn head(&self) -> Option<ThreadId> {
        self.items[0]
    }

    fn remove(&mut self, id: ThreadId) -> bool {
        for i in 0..self.len {
            if self.items[i] == Some(id) {
                for j in i..self.len - 1 {
                    self.items[j] = self.items[j + 1];
                }
                self.items[self.len - 1] = None;
                self.len -= 1;
                return true;
            }
        }
        false
    }

    fn is_tail(&self, id: ThreadId) -> bool {
        self.len > 0 && self.items[self.len - 1] == Some(id)
    }
}

/// Priority-indexed ready queue with an occupancy bitmap and a cached
/// best thread.
///
/// The cache holds the thread to run next, or `None` when it must be
/// recomputed from the bitmap. `add`, `remove` and `move_to_end` are the
/// only places a thread enters, leaves or moves within the queue.
pub(crate) struct ReadyQueue {
    queues: [PrioList; NUM_PRIORITIES],
    bitmap: u32,
    cache: Option<(ThreadId, i8)>,
}

impl ReadyQueue {
    const fn new() -> Self {
        ReadyQueue {
            queues: [const { PrioList::new() }; NUM_PRIORITIES],
            bitmap: 0,
            cache: None,
        }
    }

    pub(crate) fn add(&mut self, id: ThreadId, prio: i8) {
        let qi = prio_index(prio);
        self.queues[qi].push_back(id);
        self.bitmap |= 1 << qi;

        // a valid cache is only displaced by a strictly higher priority;
        // equal priority keeps FIFO order
        if let Some((_, cached_prio)) = self.cache {
            if prio < cached_prio {
                self.cache = Some((id, prio));
            }
        }
    }

    pub(crate) fn remove(&mut self, id: ThreadId, prio: i8) {
        let qi = prio_index(prio);
        if self.queues[qi].remove(id) && self.queues[qi].len == 0 {
            self.bitmap &= !(1 << qi);
        }
        if let Some((cached, _)) = self.cache {
            if cached == id {
                self.cache = None;
            }
        }
    }

    /// Requeue `id` behind its priority peers; used by yield.
    pub(crate) fn move_to_end(&mut self, id: ThreadId, prio: i8) {
        let qi = prio_index(prio);
        if self.queues[qi].is_tail(id) {
            return;
        }
        if self.queues[qi].remove(id) {
            self.queues[qi].push_back(id);
        }
        if let Some((cached, _)) = self.cache {
            if cached == id {
                self.cache = None;
            }
        }
    }

    /// Highest-priority, earliest-queued ready thread.
    pub(crate) fn next(&mut self) -> Option<ThreadId> {
        if let Some((cached, _)) = self.cache {
            return Some(cached);
        }
        if self.bitmap == 0 {
            return None;
        }
        let qi = self.bitmap.trailing_zeros() as usize;
        let head = self.queues[qi].head();
        self.cache = head.map(|id| (id, qi as i8 - NUM_COOP_PRIORITIES));
        head
    }

    pub(crate) fn highest_prio(&self) -> Option<i8> {
        if self.bitmap == 0 {
            return None;
        }
        Some(self.bitmap.trailing_zeros() as i8 - NUM_COOP_PRIORITIES)
    }

    pub(crate) fn contains(&self, id: ThreadId, prio: i8) -> bool {
        let q = &self.queues[prio_index(prio)];
        q.items[..q.len].contains(&Some(id))
    }
}

/// The process-wide kernel context: thread registry (doubling as the
/// all-threads list), ready queue, timeout list and current thread.
pub(crate) struct Kernel {
    threads: [Option<Thread>; MAX_THREADS],
    generations: [u16; MAX_THREADS],
    pub(crate) ready_q: ReadyQueue,
    pub(crate) timeout_q: TimeoutList,
    #[cfg(feature = "semaphore-groups")]
    pub(crate) proxies: ProxyPool,
    current: Option<ThreadId>,
    booted: bool,
}

pub(crate) struct KernelCell(UnsafeCell<Kernel>);

// All access is mediated by the interrupt lock.
unsafe impl Sync for KernelCell {}

pub(crate) static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new()));

impl Kernel {
    pub(crate) const fn new() -> Self {
        Kernel {
            threads: [const { None }; MAX_THREADS],
            generations: [0; MAX_THREADS],
            ready_q: ReadyQueue::new(),
            timeout_q: TimeoutList::new(),
            #[cfg(feature = "semaphore-groups")]
            proxies: ProxyPool::new(),
            current: None,
            booted: false,
        }
    }

    /// # Safety
    ///
    /// Returns a mutable reference to the kernel context. The caller must
    /// hold the interrupt lock for the whole time the reference is live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get() -> &'static mut Kernel {
        &mut *KERNEL.0.get()
    }

    pub(crate) fn is_booted(&self) -> bool {
        self.booted
    }

    pub(crate) fn current(&self) -> ThreadId {
        kassert!(self.booted, "kernel not booted");
        self.current.unwrap_or_else(|| crate::fatal::oops("no current thread"))
    }

    /// The current thread's slot, valid even mid self-abort (the slot is
    /// retained until the final switch).
    pub(crate) fn current_thread(&mut self) -> &mut Thread {
        let id = self.current();
        match self.threads[id.slot() as usize].as_mut() {
            Some(t) => t,
            None => crate::fatal::oops("current thread slot empty"),
        }
    }

    /// Generation-checked lookup; `None` for stale handles and dead
    /// threads.
    pub(crate) fn tref(&self, id: ThreadId) -> Option<&Thread> {
        let slot = id.slot() as usize;
        if slot >= MAX_THREADS || self.generations[slot] != id.gen() {
            return None;
        }
        self.threads[slot].as_ref().filter(|t| !t.flags.has(flags::DEAD))
    }

    pub(crate) fn tmut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        let slot = id.slot() as usize;
        if slot >= MAX_THREADS || self.generations[slot] != id.gen() {
            return None;
        }
        self.threads[slot].as_mut().filter(|t| !t.flags.has(flags::DEAD))
    }

    /// Lookup that must succeed: the handle came from a kernel queue.
    pub(crate) fn expect(&mut self, id: ThreadId) -> &mut Thread {
        match self.tmut(id) {
            Some(t) => t,
            None => crate::fatal::oops("stale thread handle in kernel queue"),
        }
    }

    /// Place a thread in a free slot and hand out its generation-checked
    /// handle.
    pub(crate) fn alloc_thread(&mut self, thread: Thread) -> KernelResult<ThreadId> {
        for slot in 0..MAX_THREADS {
            let reusable = match &self.threads[slot] {
                None => true,
                // a dead slot lingers only while it is still the current
                // execution context (self-abort before the final switch)
                Some(t) => t.flags.has(flags::DEAD) && self.current.map(|c| c.slot() as usize) != Some(slot),
            };
            if reusable {
                self.threads[slot] = Some(thread);
                return Ok(ThreadId::from_raw(slot as u16, self.generations[slot]));
            }
        }
        Err(KernelError::MaxThreadsReached)
    }

    /// Drop a thread from the registry and invalidate its handles.
    pub(crate) fn release_thread(&mut self, id: ThreadId) {
        let slot = id.slot() as usize;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        if self.current != Some(id) {
            self.threads[slot] = None;
        }
    }

    /// Add to the ready queue if the thread's state allows running.
    pub(crate) fn ready_thread(&mut self, id: ThreadId) {
        let (ready, prio) = {
            let t = self.expect(id);
            (t.is_ready(), t.prio)
        };
        if ready {
            self.ready_q.add(id, prio);
        }
    }

    /// Block a thread: out of the ready queue, onto `wait_q` (if any, in
    /// priority order), onto the timeout list for finite waits.
    pub(crate) fn pend(&mut self, id: ThreadId, wait_q: Option<NonNull<WaitQueue>>, timeout: Timeout) {
        let (was_ready, prio) = {
            let t = self.expect(id);
            (t.is_ready(), t.prio)
        };
        if was_ready {
            self.ready_q.remove(id, prio);
        }

        if let Some(wq) = wait_q {
            // Safety: wait queues live inside 'static semaphores and are
            // only touched under the interrupt lock, which we hold.
            unsafe { (*wq.as_ptr()).insert(Waiter::Thread(id), prio) };
        }

        let t = self.expect(id);
        t.flags.set(flags::PENDING);
        t.pended_on = wait_q;

        if let Timeout::Millis(ms) = timeout {
            self.expect(id).flags.set(flags::TIMING);
            self.timeout_q.add(id, ms_to_ticks(ms).max(1));
        }
    }

    /// Undo a pend: leave the wait queue and clear the pending state.
    /// The timeout, if armed, is the caller's business.
    pub(crate) fn unpend(&mut self, id: ThreadId) {
        let wq = {
            let t = self.expect(id);
            t.flags.clear(flags::PENDING);
            t.pended_on.take()
        };
        if let Some(wq) = wq {
            // Safety: as in pend
            unsafe { (*wq.as_ptr()).remove(Waiter::Thread(id)) };
        }
    }

    /// Timeout-list expiry: decide what the deadline meant from the
    /// thread's state.
    pub(crate) fn expire(&mut self, id: ThreadId) {
        let t = match self.tmut(id) {
            Some(t) => t,
            None => return, // aborted in the same tick
        };
        t.flags.clear(flags::TIMING);

        if !t.flags.has(flags::STARTED) {
            // delayed start came due
            t.flags.set(flags::STARTED);
        } else if t.flags.has(flags::PENDING) {
            t.swap_retval = Err(KernelError::TimedOut);
            self.unpend(id);
        } else {
            // end of a sleep
            t.swap_retval = Ok(());
        }
        self.ready_thread(id);
    }

    /// Live thread in `slot` whose group mask intersects `mask`, if any.
    pub(crate) fn thread_in_group(&self, slot: usize, mask: u32) -> Option<ThreadId> {
        let t = self.threads[slot].as_ref()?;
        if t.flags.has(flags::DEAD) || t.groups & mask == 0 {
            return None;
        }
        Some(ThreadId::from_raw(slot as u16, self.generations[slot]))
    }

    /// Whether the scheduler would pick a different thread right now.
    pub(crate) fn must_switch_threads(&mut self) -> bool {
        let (cur_ready, cur_prio, preemptible) = {
            let t = self.current_thread();
            (t.is_ready(), t.prio, t.is_preemptible())
        };
        if !cur_ready {
            return true;
        }
        if !preemptible {
            return false;
        }
        match self.ready_q.highest_prio() {
            Some(best) => best < cur_prio,
            None => false,
        }
    }
}

/// Pick the next ready thread and switch to it, releasing the interrupt
/// lock as part of the switch. Returns, to whichever thread resumes at
/// this call site, the wake value stashed for it by its waker.
///
/// Fast path: if the calling thread is still the best choice the lock is
/// released and no switch happens.
///
/// # Safety
///
/// `key` must be the token of the live outermost critical section. Not
/// callable from interrupt context. With the simulated port this performs
/// the full scheduling bookkeeping but execution stays on the caller's
/// stack, and the returned value is the one stashed for the switched-in
/// thread.
pub(crate) unsafe fn swap(key: IrqKey) -> KernelResult<()> {
    let kernel = Kernel::get();
    let cur = kernel.current();

    let next = match kernel.ready_q.next() {
        Some(next) => next,
        None => crate::fatal::oops("no ready thread to run"),
    };
    if next == cur {
        irq_unlock(key);
        return Ok(());
    }

    k_debug!("context switch");
    kernel.current = Some(next);

    let prev_ctx = {
        let slot = cur.slot() as usize;
        match kernel.threads[slot].as_mut() {
            Some(t) => &mut t.ctx as *mut _,
            None => crate::fatal::oops("switching out of an empty slot"),
        }
    };
    let next_ctx = {
        let t = kernel.expect(next);
        &t.ctx as *const _
    };

    DefaultArch::context_switch(prev_ctx, next_ctx);

    // resumed: we are the current thread again (real ports); report the
    // value our waker stashed
    let retval = Kernel::get().current_thread().swap_retval;
    irq_unlock(key);
    retval
}

/// Switch away if a reschedule is due; plain unlock otherwise. From
/// interrupt context this never switches, it only releases the lock; the
/// switch happens at the next thread-context reschedule point.
pub(crate) fn reschedule(key: IrqKey) {
    let kernel = unsafe { Kernel::get() };
    if !DefaultArch::in_isr() && kernel.is_booted() && kernel.must_switch_threads() {
        let _ = unsafe { swap(key) };
    } else {
        irq_unlock(key);
    }
}

/// Initialize the kernel: register the calling context as the main
/// thread and spawn the idle thread on the supplied stack. Called once;
/// a second boot is a fatal error.
pub fn boot(idle_stack: &'static mut [u8]) -> ThreadId {
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    kassert!(!kernel.booted, "kernel booted twice");

    let main = Thread::new(&mut [], idle_entry, (0, 0, 0), MAIN_PRIO, Options::default());
    let main_id = match kernel.alloc_thread(main) {
        Ok(id) => id,
        Err(_) => crate::fatal::oops("thread registry full at boot"),
    };
    kernel.expect(main_id).flags.set(flags::STARTED);

    let mut idle = Thread::new(
        idle_stack,
        idle_entry,
        (0, 0, 0),
        LOWEST_PRIO,
        Options {
            essential: true,
            ..Options::default()
        },
    );
    idle.init_context();
    let idle_id = match kernel.alloc_thread(idle) {
        Ok(id) => id,
        Err(_) => crate::fatal::oops("thread registry full at boot"),
    };
    kernel.expect(idle_id).flags.set(flags::STARTED);

    kernel.booted = true;
    kernel.current = Some(main_id);
    kernel.ready_q.add(main_id, MAIN_PRIO);
    kernel.ready_q.add(idle_id, LOWEST_PRIO);

    irq_unlock(key);
    main_id
}

fn idle_entry(_a: usize, _b: usize, _c: usize) {
    loop {
        core::hint::spin_loop();
    }
}

/// Hand the CPU to the next thread of the same or higher priority; the
/// caller goes to the back of its priority's FIFO.
pub fn yield_now() {
    kassert!(!DefaultArch::in_isr(), "yield from interrupt context");
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    let cur = kernel.current();
    let prio = kernel.current_thread().prio;

    kernel.ready_q.move_to_end(cur, prio);
    if kernel.ready_q.next() == Some(cur) {
        irq_unlock(key);
    } else {
        let _ = unsafe { swap(key) };
    }
}

/// Put the current thread to sleep for `ms` milliseconds. Zero behaves
/// as a yield.
pub fn sleep(ms: u32) {
    kassert!(!DefaultArch::in_isr(), "sleep from interrupt context");
    if ms == 0 {
        yield_now();
        return;
    }

    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    let cur = kernel.current();
    let prio = kernel.current_thread().prio;

    kernel.current_thread().flags.set(flags::TIMING);
    kernel.ready_q.remove(cur, prio);
    kernel.timeout_q.add(cur, ms_to_ticks(ms).max(1));

    let _ = unsafe { swap(key) };
}

/// Wake a sleeping thread early. Threads pending on an object, and
/// threads with no armed timeout, are left alone.
pub fn wakeup(id: ThreadId) -> KernelResult<()> {
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };

    let t = match kernel.tmut(id) {
        Some(t) => t,
        None => {
            irq_unlock(key);
            return Err(KernelError::InvalidState);
        }
    };
    if t.flags.has(flags::PENDING) {
        irq_unlock(key);
        return Ok(());
    }
    if !kernel.timeout_q.abort(id) {
        irq_unlock(key);
        return Ok(());
    }

    kernel.expect(id).flags.clear(flags::TIMING);
    kernel.ready_thread(id);
    reschedule(key);
    Ok(())
}

/// Latch preemption off for the current thread. Depth-counted; pair each
/// call with [`sched_unlock`].
pub fn sched_lock() {
    kassert!(!DefaultArch::in_isr(), "scheduler lock from interrupt context");
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    kernel.current_thread().sched_locked += 1;
    irq_unlock(key);
}

/// Release one level of the preemption latch and reschedule.
pub fn sched_unlock() {
    kassert!(!DefaultArch::in_isr(), "scheduler unlock from interrupt context");
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    let t = kernel.current_thread();
    kassert!(t.sched_locked > 0, "scheduler not locked");
    t.sched_locked -= 1;
    k_debug!("scheduler unlocked");
    reschedule(key);
}

#[cfg(test)]
pub(crate) mod test_support {
    //! The kernel is a process-wide singleton, so tests that touch it
    //! serialize on one mutex and start from a fresh state.

    use super::*;
    use std::boxed::Box;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn fresh_kernel() -> MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        crate::arch::SimArch::reset();
        unsafe {
            *Kernel::get() = Kernel::new();
        }
        guard
    }

    pub(crate) fn booted_kernel() -> (MutexGuard<'static, ()>, ThreadId) {
        let guard = fresh_kernel();
        let main = boot(Box::leak(Box::new([0u8; 1024])));
        (guard, main)
    }

    pub(crate) fn leaked_stack() -> &'static mut [u8] {
        Box::leak(Box::new([0u8; 4096]))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::thread;

    #[test]
    fn boot_installs_main_and_idle() {
        let (_guard, main) = booted_kernel();
        let kernel = unsafe { Kernel::get() };

        assert_eq!(kernel.current(), main);
        assert!(kernel.ready_q.contains(main, MAIN_PRIO));
        assert_eq!(kernel.ready_q.next(), Some(main));
        assert_eq!(kernel.ready_q.highest_prio(), Some(MAIN_PRIO));
    }

    #[test]
    fn ready_queue_orders_by_priority_then_fifo() {
        let (_guard, main) = booted_kernel();

        let a = thread::spawn(leaked_stack(), noop, (0, 0, 0), 5, Options::default(), 0).unwrap();
        let b = thread::spawn(leaked_stack(), noop, (0, 0, 0), 5, Options::default(), 0).unwrap();
        let hi = thread::spawn(leaked_stack(), noop, (0, 0, 0), -1, Options::default(), 0).unwrap();

        // spawning hi preempted main (bookkeeping-only on the simulated
        // port): it is now both current and the queue head
        let kernel = unsafe { Kernel::get() };
        assert_eq!(kernel.current(), hi);
        assert_eq!(kernel.ready_q.next(), Some(hi));

        kernel.ready_q.remove(hi, -1);
        // main (prio 0) still outranks both workers
        kernel.ready_q.remove(main, MAIN_PRIO);
        assert_eq!(kernel.ready_q.next(), Some(a));
        kernel.ready_q.remove(a, 5);
        assert_eq!(kernel.ready_q.next(), Some(b));
    }

    #[test]
    fn cache_survives_equal_priority_insert() {
        let (_guard, _main) = booted_kernel();

        let a = thread::spawn(leaked_stack(), noop, (0, 0, 0), 3, Options::default(), 0).unwrap();
        let kernel = unsafe { Kernel::get() };
        let main = kernel.current();
        kernel.ready_q.remove(main, MAIN_PRIO);

        assert_eq!(kernel.ready_q.next(), Some(a));
        drop(kernel);

        let b = thread::spawn(leaked_stack(), noop, (0, 0, 0), 3, Options::default(), 0).unwrap();
        let kernel = unsafe { Kernel::get() };
        assert_eq!(kernel.ready_q.next(), Some(a));

        kernel.ready_q.remove(a, 3);
        assert_eq!(kernel.ready_q.next(), Some(b));
    }

    #[test]
    fn yield_requeues_behind_equal_priority() {
        let (_guard, main) = booted_kernel();

        let peer = thread::spawn(leaked_stack(), noop, (0, 0, 0), MAIN_PRIO, Options::default(), 0).unwrap();

        yield_now();

        // with the simulated port the switch is bookkeeping only: the
        // peer is now the chosen thread and main sits behind it
        let kernel = unsafe { Kernel::get() };
        assert_eq!(kernel.current(), peer);
        assert!(kernel.ready_q.contains(main, MAIN_PRIO));
    }

    #[test]
    fn sleep_arms_timeout_and_expiry_readies() {
        let (_guard, main) = booted_kernel();

        sleep(20);

        let kernel = unsafe { Kernel::get() };
        assert!(kernel.timeout_q.is_armed(main));
        assert!(!kernel.ready_q.contains(main, MAIN_PRIO));
        assert!(kernel.expect(main).flags.has(flags::TIMING));

        for _ in 0..ms_to_ticks(20) {
            let expired = kernel.timeout_q.tick();
            for id in expired.iter() {
                kernel.expire(id);
            }
        }
        assert!(!kernel.expect(main).flags.has(flags::TIMING));
        assert!(kernel.ready_q.contains(main, MAIN_PRIO));
        assert_eq!(kernel.expect(main).swap_retval, Ok(()));
    }

    #[test]
    fn wakeup_cancels_a_sleep() {
        let (_guard, _main) = booted_kernel();

        let t = thread::spawn(leaked_stack(), noop, (0, 0, 0), 4, Options::default(), 0).unwrap();

        // stage a sleeping state for the worker
        let kernel = unsafe { Kernel::get() };
        kernel.ready_q.remove(t, 4);
        kernel.expect(t).flags.set(flags::TIMING);
        kernel.timeout_q.add(t, 100);

        wakeup(t).unwrap();

        let kernel = unsafe { Kernel::get() };
        assert!(!kernel.timeout_q.is_armed(t));
        assert!(kernel.ready_q.contains(t, 4));
    }

    #[test]
    fn wakeup_ignores_pended_threads() {
        let (_guard, _main) = booted_kernel();

        let t = thread::spawn(leaked_stack(), noop, (0, 0, 0), 4, Options::default(), 0).unwrap();
        let kernel = unsafe { Kernel::get() };
        kernel.pend(t, None, Timeout::Millis(50));
        let armed_before = kernel.timeout_q.armed_count();

        wakeup(t).unwrap();

        let kernel = unsafe { Kernel::get() };
        assert_eq!(kernel.timeout_q.armed_count(), armed_before);
        assert!(kernel.expect(t).flags.has(flags::PENDING));
    }

    #[test]
    fn must_switch_respects_cooperative_current() {
        let (_guard, main) = booted_kernel();

        let kernel = unsafe { Kernel::get() };
        kernel.expect(main).prio = -2;
        let main_id = main;
        kernel.ready_q.remove(main_id, MAIN_PRIO);
        kernel.ready_q.add(main_id, -2);

        drop(kernel);
        let hi = thread::spawn(leaked_stack(), noop, (0, 0, 0), -5, Options::default(), 0).unwrap();

        let kernel = unsafe { Kernel::get() };
        // a higher-priority thread is ready, but the current thread is
        // cooperative: no forced switch
        assert!(kernel.ready_q.contains(hi, -5));
        assert!(!kernel.must_switch_threads());
    }

    #[test]
    fn sched_lock_defers_preemption() {
        let (_guard, main) = booted_kernel();

        sched_lock();
        let _hi = thread::spawn(leaked_stack(), noop, (0, 0, 0), -3, Options::default(), 0).unwrap();

        let kernel = unsafe { Kernel::get() };
        // spawn of a higher-priority thread did not switch away
        assert_eq!(kernel.current(), main);
        assert!(!kernel.must_switch_threads());

        sched_unlock();
        let kernel = unsafe { Kernel::get() };
        assert_ne!(kernel.current(), main);
    }

    fn noop(_a: usize, _b: usize, _c: usize) {}
}
