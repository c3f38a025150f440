//! Counting semaphores.
//!
//! Each `give` increments the count by one if nobody is pending;
//! otherwise the unit is handed directly to the chosen waiter and the
//! count is left alone, so a later `take` by another thread can never
//! steal a slot already granted. The count saturates silently at the
//! configured limit.
//!
//! Semaphore groups let one thread wait for any of several semaphores.
//! The original trick of pending a stack-allocated dummy thread on every
//! queue becomes an explicit [`Waiter::Proxy`] entry drawn from a fixed
//! pool scoped to the call; the first `give` to reach a proxy wins,
//! cancels its peers and wakes the real thread exactly once.
//!
//! # Safety
//!
//! Semaphore internals sit in an `UnsafeCell` and are only touched with
//! the interrupt lock held. Blocking operations require `&'static self`,
//! so the wait-queue back-references held by pended threads and proxies
//! cannot outlive the semaphore.

use crate::arch::{Arch, DefaultArch};
use crate::error::{KernelError, KernelResult};
use crate::fatal::kassert;
use crate::irq::{irq_lock, irq_unlock};
use crate::sched::{swap, Kernel};
use crate::thread::{flags, ThreadId};
use crate::time::Timeout;
use crate::wait_q::{WaitQueue, Waiter};
use core::cell::UnsafeCell;
use core::ptr::NonNull;

#[cfg(feature = "semaphore-groups")]
use crate::config::{MAX_GROUP_SIZE, MAX_WAIT_PROXIES};

struct SemInner {
    count: u32,
    limit: u32,
    wait_q: WaitQueue,
}

/// Counting semaphore. Statically allocatable; lives for the process
/// lifetime.
pub struct Semaphore {
    inner: UnsafeCell<SemInner>,
}

// interior state is protected by the interrupt lock
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Create a semaphore with an initial count and a hard limit.
    /// A zero limit is a contract violation. An initial count above the
    /// limit is not validated; callers must not do that.
    pub const fn new(initial: u32, limit: u32) -> Self {
        assert!(limit != 0, "semaphore limit cannot be zero");
        Semaphore {
            inner: UnsafeCell::new(SemInner {
                count: initial,
                limit,
                wait_q: WaitQueue::new(),
            }),
        }
    }

    /// Current count.
    pub fn count(&self) -> u32 {
        let key = irq_lock();
        // Safety: lock held
        let count = unsafe { (*self.inner.get()).count };
        irq_unlock(key);
        count
    }

    /// Take a unit, pending up to `timeout` if none is available.
    /// Interrupt context may only use [`Timeout::NoWait`].
    pub fn take(&'static self, timeout: Timeout) -> KernelResult<()> {
        kassert!(
            !DefaultArch::in_isr() || matches!(timeout, Timeout::NoWait),
            "blocking take from interrupt context"
        );

        let key = irq_lock();
        // Safety: lock held; borrow ends before pending
        let inner = unsafe { &mut *self.inner.get() };
        if inner.count > 0 {
            inner.count -= 1;
            irq_unlock(key);
            return Ok(());
        }
        if matches!(timeout, Timeout::NoWait) {
            irq_unlock(key);
            return Err(KernelError::WouldBlock);
        }

        let kernel = unsafe { Kernel::get() };
        let me = kernel.current();
        kernel.pend(me, Some(self.wait_q_ptr()), timeout);
        // Safety: key is the live critical section token
        unsafe { swap(key) }
    }

    /// Release one unit: wake the best waiter, or bump the count
    /// (saturating at the limit) when nobody is pending. May preempt a
    /// thread-context caller; interrupt-context callers only mark ready.
    pub fn give(&self) {
        let key = irq_lock();
        let kernel = unsafe { Kernel::get() };
        if give_one(self, kernel) {
            let _ = unsafe { swap(key) };
        } else {
            irq_unlock(key);
        }
    }

    /// Force the count to zero without waking anyone. Must not be called
    /// while the semaphore is the target of a pending group wait.
    pub fn reset(&self) {
        let key = irq_lock();
        // Safety: lock held
        unsafe { (*self.inner.get()).count = 0 };
        irq_unlock(key);
    }

    pub(crate) fn wait_q_ptr(&'static self) -> NonNull<WaitQueue> {
        // Safety: the semaphore is 'static, so the queue address is
        // stable for the life of the process
        unsafe { NonNull::new_unchecked(core::ptr::addr_of_mut!((*self.inner.get()).wait_q)) }
    }

    /// # Safety
    ///
    /// Caller must hold the interrupt lock and drop the reference before
    /// releasing it.
    pub(crate) unsafe fn wait_q_mut(&self) -> &mut WaitQueue {
        &mut (*self.inner.get()).wait_q
    }

    #[cfg(test)]
    fn wait_q_len(&self) -> usize {
        let key = irq_lock();
        let len = unsafe { (*self.inner.get()).wait_q.len() };
        irq_unlock(key);
        len
    }
}

/// Give on one semaphore with the lock already held; reports whether the
/// caller should swap.
fn give_one(sem: &Semaphore, kernel: &mut Kernel) -> bool {
    // Safety: lock held; the borrow is scoped to the pop
    let popped = unsafe { (*sem.inner.get()).wait_q.pop() };

    let woken_prio = match popped {
        None => {
            // Safety: as above
            let inner = unsafe { &mut *sem.inner.get() };
            // count saturates silently at the limit
            inner.count += (inner.count != inner.limit) as u32;
            return false;
        }
        Some(Waiter::Thread(id)) => {
            kernel.timeout_q.abort(id);
            let t = kernel.expect(id);
            t.flags.clear(flags::TIMING);
            t.flags.clear(flags::PENDING);
            t.pended_on = None;
            t.swap_retval = Ok(());
            let prio = t.prio;
            kernel.ready_thread(id);
            prio
        }
        #[cfg(feature = "semaphore-groups")]
        Some(Waiter::Proxy(pid)) => match handle_group(sem, pid, kernel) {
            Some(prio) => prio,
            None => return false,
        },
    };

    wake_preempts(kernel, woken_prio)
}

/// A give from thread context swaps when the woken thread's priority is
/// the same or higher than the (preemptible) caller's; interrupt-context
/// givers never swap themselves.
fn wake_preempts(kernel: &mut Kernel, woken_prio: i8) -> bool {
    if DefaultArch::in_isr() || !kernel.is_booted() {
        return false;
    }
    let t = kernel.current_thread();
    if !t.is_ready() {
        return true;
    }
    t.is_preemptible() && woken_prio <= t.prio
}

// ---------------------------------------------------------------------
// semaphore groups
// ---------------------------------------------------------------------

/// Handle to a pool slot holding a group-wait proxy.
#[cfg(feature = "semaphore-groups")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProxyId(u8);

/// Stand-in wait-queue entry pended on one semaphore of a group on
/// behalf of the real waiting thread.
#[cfg(feature = "semaphore-groups")]
#[derive(Clone, Copy)]
pub(crate) struct WaitProxy {
    owner: ThreadId,
    sem: NonNull<Semaphore>,
    next: Option<ProxyId>,
}

/// Per-thread record of an in-flight group wait: the peer list head and
/// the semaphore that won.
#[cfg(feature = "semaphore-groups")]
pub(crate) struct GroupWait {
    head: Option<ProxyId>,
    winner: Option<NonNull<Semaphore>>,
}

/// Fixed pool the proxies are drawn from, scoped to one group-wait call:
/// every exit path (win, timeout, abort) releases them.
#[cfg(feature = "semaphore-groups")]
pub(crate) struct ProxyPool {
    slots: [Option<WaitProxy>; MAX_WAIT_PROXIES],
}

#[cfg(feature = "semaphore-groups")]
impl ProxyPool {
    pub(crate) const fn new() -> Self {
        ProxyPool {
            slots: [const { None }; MAX_WAIT_PROXIES],
        }
    }

    fn alloc(&mut self, proxy: WaitProxy) -> ProxyId {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(proxy);
                return ProxyId(i as u8);
            }
        }
        crate::fatal::oops("group-wait proxy pool exhausted")
    }

    fn get(&self, id: ProxyId) -> WaitProxy {
        match self.slots[id.0 as usize] {
            Some(proxy) => proxy,
            None => crate::fatal::oops("freed group-wait proxy referenced"),
        }
    }

    fn link(&mut self, from: ProxyId, to: ProxyId) {
        if let Some(proxy) = self.slots[from.0 as usize].as_mut() {
            proxy.next = Some(to);
        }
    }

    fn free(&mut self, id: ProxyId) {
        self.slots[id.0 as usize] = None;
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// Atomically take the first available of several semaphores, or pend on
/// all of them until one is given. Returns the index of the semaphore
/// that supplied the unit.
///
/// The list must be non-empty and no longer than the configured group
/// size; violating either is fatal. Interrupt context may only use
/// [`Timeout::NoWait`].
#[cfg(feature = "semaphore-groups")]
pub fn group_take(sems: &[&'static Semaphore], timeout: Timeout) -> KernelResult<usize> {
    kassert!(!sems.is_empty(), "empty semaphore group");
    kassert!(sems.len() <= MAX_GROUP_SIZE, "semaphore group too large");
    kassert!(
        !DefaultArch::in_isr() || matches!(timeout, Timeout::NoWait),
        "blocking group take from interrupt context"
    );

    let key = irq_lock();
    for (i, sem) in sems.iter().enumerate() {
        // Safety: lock held; borrow scoped to this arm
        let inner = unsafe { &mut *sem.inner.get() };
        if inner.count > 0 {
            inner.count -= 1;
            irq_unlock(key);
            return Ok(i);
        }
    }
    if matches!(timeout, Timeout::NoWait) {
        irq_unlock(key);
        return Err(KernelError::WouldBlock);
    }

    let kernel = unsafe { Kernel::get() };
    let me = kernel.current();
    pend_on_group(kernel, me, sems, timeout);
    // Safety: key is the live critical section token
    let res = unsafe { swap(key) };

    // back from the wait: release surviving proxies whatever happened
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    let winner = teardown_group(kernel, me);
    irq_unlock(key);

    res?;
    let winner = match winner {
        Some(w) => w,
        None => crate::fatal::oops("group wait won without a winner"),
    };
    match sems.iter().position(|s| core::ptr::eq(*s, winner.as_ptr())) {
        Some(i) => Ok(i),
        None => crate::fatal::oops("group winner not in the list"),
    }
}

/// Give on every semaphore in the list under one lock acquisition,
/// deferring the switch decision until all are processed.
#[cfg(feature = "semaphore-groups")]
pub fn group_give(sems: &[&'static Semaphore]) {
    kassert!(!sems.is_empty(), "empty semaphore group");
    let key = irq_lock();
    let kernel = unsafe { Kernel::get() };
    let mut needs_swap = false;
    for sem in sems {
        needs_swap |= give_one(sem, kernel);
    }
    if needs_swap {
        let _ = unsafe { swap(key) };
    } else {
        irq_unlock(key);
    }
}

/// Zero the count of every semaphore in the list, with no wake effects.
/// Must not race a pending group wait on any of them.
#[cfg(feature = "semaphore-groups")]
pub fn group_reset(sems: &[&'static Semaphore]) {
    kassert!(!sems.is_empty(), "empty semaphore group");
    let key = irq_lock();
    for sem in sems {
        // Safety: lock held
        unsafe { (*sem.inner.get()).count = 0 };
    }
    irq_unlock(key);
}

/// Pend `id` on every semaphore of the group through proxies, and pend
/// the thread itself detached from any queue. Lock must be held.
#[cfg(feature = "semaphore-groups")]
pub(crate) fn pend_on_group(
    kernel: &mut Kernel,
    id: ThreadId,
    sems: &[&'static Semaphore],
    timeout: Timeout,
) {
    let prio = kernel.expect(id).prio;

    let mut pids = [None; MAX_GROUP_SIZE];
    for (i, sem) in sems.iter().enumerate() {
        let pid = kernel.proxies.alloc(WaitProxy {
            owner: id,
            sem: NonNull::from(*sem),
            next: None,
        });
        pids[i] = Some(pid);
        // Safety: lock held; borrow scoped to the insert
        unsafe { sem.wait_q_mut().insert(Waiter::Proxy(pid), prio) };
    }
    for i in 0..sems.len() - 1 {
        if let (Some(a), Some(b)) = (pids[i], pids[i + 1]) {
            kernel.proxies.link(a, b);
        }
    }

    kernel.expect(id).group_wait = Some(GroupWait {
        head: pids[0],
        winner: None,
    });
    kernel.pend(id, None, timeout);
}

/// Unlink and free whatever proxies of `id`'s group wait are still
/// pended; reports the winning semaphore, if one was recorded.
#[cfg(feature = "semaphore-groups")]
pub(crate) fn teardown_group(kernel: &mut Kernel, id: ThreadId) -> Option<NonNull<Semaphore>> {
    let gw = match kernel.tmut(id) {
        Some(t) => t.group_wait.take(),
        None => None,
    }?;

    let mut cursor = gw.head;
    while let Some(pid) = cursor {
        let proxy = kernel.proxies.get(pid);
        // Safety: peer semaphores are 'static; lock held
        unsafe { proxy.sem.as_ref().wait_q_mut().remove(Waiter::Proxy(pid)) };
        kernel.proxies.free(pid);
        cursor = proxy.next;
    }
    gw.winner
}

/// A give popped a group proxy: cancel and unlink every peer, record the
/// winning semaphore, and ready the real thread at most once, however
/// many gives race. Returns the woken priority when this give actually
/// readied the thread.
#[cfg(feature = "semaphore-groups")]
fn handle_group(sem: &Semaphore, pid: ProxyId, kernel: &mut Kernel) -> Option<i8> {
    let owner = kernel.proxies.get(pid).owner;

    let mut cursor = {
        let t = kernel.expect(owner);
        let gw = match t.group_wait.as_mut() {
            Some(gw) => gw,
            None => crate::fatal::oops("group proxy without a group wait"),
        };
        gw.winner = Some(NonNull::from(sem));
        gw.head.take()
    };
    while let Some(p) = cursor {
        let proxy = kernel.proxies.get(p);
        if p != pid {
            // Safety: peer semaphores are 'static; lock held
            unsafe { proxy.sem.as_ref().wait_q_mut().remove(Waiter::Proxy(p)) };
        }
        kernel.proxies.free(p);
        cursor = proxy.next;
    }

    // the unit goes to the group even if the wait timed out an instant
    // ago and has not resumed yet; readying, though, happens only once
    let already_ready = kernel.expect(owner).is_ready();
    kernel.timeout_q.abort(owner);
    {
        let t = kernel.expect(owner);
        t.flags.clear(flags::TIMING);
        t.flags.clear(flags::PENDING);
        t.pended_on = None;
        t.swap_retval = Ok(());
    }
    if already_ready {
        return None;
    }
    kernel.ready_thread(owner);
    Some(kernel.expect(owner).prio)
}
