//! Mutexes.
//!
//! A mutex combines a *type* (relock behavior) with a *locking protocol*
//! (priority management). Ownership hand-off happens in `unlock`: the head
//! waiter receives the lock before it is made Ready, so the mutex is never
//! observably free while waiters exist.
//!
//! The priority-inheritance machinery lives here. A thread's effective
//! priority is `max(base, boosts)`, where each held mutex contributes its
//! ceiling (priority-protect) or the effective priority of its head waiter
//! (priority-inheritance). Any event that can change an input of that
//! computation — waiter arrival, waiter removal, ownership transfer, a base
//! priority change — calls [`update_priority_of_thread`], which walks the
//! contention chain `waiter → owner → (if blocked) next owner → …`,
//! recomputing and repositioning at each step, and stops as soon as a step
//! produces no change.
use core::{fmt, marker::PhantomData, ptr};

use crate::{
    cfg,
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, thread, timeout,
    utils::Init,
    wait::{self, WaitPayload, WaitQueue},
    Error, Id, KernelTraits, PortThreading, Priority, Result, ThreadCb, UTicks,
};

pub(super) type MutexId = Id;

/// Relock behavior of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// Relocking by the owner is an error (reported as a deadlock, which it
    /// would otherwise be).
    Normal,
    /// Relocking by the owner and unlocking by a non-owner are detected and
    /// reported.
    ErrorChecking,
    /// The owner may relock; the mutex is released by the matching number of
    /// unlocks.
    Recursive,
}

impl Init for MutexType {
    const INIT: Self = Self::Normal;
}

/// Locking protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// No priority management.
    None,
    /// The owner inherits the highest effective priority among the waiters,
    /// transitively through chains of blocked owners.
    PriorityInheritance,
    /// The owner runs at the given ceiling priority while holding the mutex.
    /// Locking fails with [`Error::BadParam`] if the caller's effective
    /// priority exceeds the ceiling.
    PriorityProtect(Priority),
}

impl Init for MutexProtocol {
    const INIT: Self = Self::None;
}

/// *Mutex control block* — the state data of a mutex.
pub(crate) struct MutexCb<Traits: PortThreading> {
    pub(crate) kind: CpuLockCell<Traits, MutexType>,
    pub(crate) protocol: CpuLockCell<Traits, MutexProtocol>,

    /// The thread that currently owns the mutex lock. `None` iff
    /// `recursion_count == 0`.
    pub(crate) owning_thread: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// Lock depth. Exceeds 1 only for [`MutexType::Recursive`].
    pub(crate) recursion_count: CpuLockCell<Traits, u32>,

    pub(crate) wait_queue: WaitQueue<Traits>,

    /// The next element in the singly-linked list headed by
    /// `ThreadCb::last_mutex_held`, containing all mutexes currently held by
    /// the owning thread.
    pub(crate) prev_mutex_held: CpuLockCell<Traits, Option<&'static MutexCb<Traits>>>,
}

// Safety: all interior mutability is `CpuLockCell`-mediated
unsafe impl<Traits: PortThreading> Sync for MutexCb<Traits> {}

impl<Traits: PortThreading> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        kind: Init::INIT,
        protocol: Init::INIT,
        owning_thread: Init::INIT,
        recursion_count: Init::INIT,
        wait_queue: Init::INIT,
        prev_mutex_held: Init::INIT,
    };
}

fn mutex_cb<Traits: KernelTraits>(
    this: MutexId,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static MutexCb<Traits>> {
    let slot = this.get() - 1;
    if slot >= Traits::state().mutex_count.get(&*lock) {
        return Err(Error::BadParam);
    }
    Ok(&Traits::state().mutexes[slot])
}

/// An owned handle to a mutex.
pub struct Mutex<Traits> {
    id: MutexId,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for Mutex<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for Mutex<Traits> {}

impl<Traits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mutex").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Create a mutex. Fails with [`Error::WouldBlock`] when the mutex arena
    /// is exhausted (mutexes are never deleted).
    pub fn new(kind: MutexType, protocol: MutexProtocol) -> Result<Self> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let count = Traits::state().mutex_count.get(&*lock);
        let mutex_cb = Traits::state()
            .mutexes
            .get(count)
            .ok_or(Error::WouldBlock)?;

        mutex_cb.kind.replace(&mut *lock, kind);
        mutex_cb.protocol.replace(&mut *lock, protocol);
        Traits::state().mutex_count.replace(&mut *lock, count + 1);

        Ok(Self {
            id: Id::new(count + 1).unwrap(),
            _phantom: PhantomData,
        })
    }

    /// Acquire the mutex, blocking until it becomes available.
    pub fn lock(self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;
        let mutex_cb = mutex_cb::<Traits>(self.id, lock.borrow_mut())?;
        lock_mutex(mutex_cb, lock, None)
    }

    /// Acquire the mutex, blocking no further than `deadline`.
    pub fn try_lock_until(self, deadline: UTicks) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;
        let mutex_cb = mutex_cb::<Traits>(self.id, lock.borrow_mut())?;
        lock_mutex(mutex_cb, lock, Some(deadline))
    }

    /// Acquire the mutex without blocking. Fails with [`Error::Busy`] if it
    /// is held by another thread.
    pub fn try_lock(self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;
        let mutex_cb = mutex_cb::<Traits>(self.id, lock.borrow_mut())?;

        match poll_lock(lock.borrow_mut(), mutex_cb, LockMode::Try)? {
            LockPoll::Acquired => Ok(()),
            LockPoll::MustBlock => Err(Error::Busy),
        }
    }

    /// Release the mutex (one level, for a recursive mutex). Fails with
    /// [`Error::NotOwner`] if the caller does not own it.
    pub fn unlock(self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;
        let mutex_cb = mutex_cb::<Traits>(self.id, lock.borrow_mut())?;
        unlock_mutex(mutex_cb, lock)
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum LockMode {
    Blocking,
    Try,
}

enum LockPoll {
    Acquired,
    MustBlock,
}

/// Check the non-blocking part of a lock operation: relock by the owner, the
/// priority-protect ceiling precondition, contention-cycle detection, and
/// the uncontended acquire.
fn poll_lock<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    mode: LockMode,
) -> Result<LockPoll> {
    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    if let Some(owner) = mutex_cb.owning_thread.get(&*lock) {
        if ptr::eq(owner, running_thread) {
            return match mutex_cb.kind.get(&*lock) {
                MutexType::Recursive => {
                    let count = mutex_cb.recursion_count.get(&*lock);
                    if count == u32::MAX {
                        return Err(Error::WouldBlock);
                    }
                    mutex_cb.recursion_count.replace(&mut *lock, count + 1);
                    Ok(LockPoll::Acquired)
                }
                MutexType::ErrorChecking => Err(Error::Deadlock),
                MutexType::Normal => match mode {
                    LockMode::Blocking => Err(Error::Deadlock),
                    LockMode::Try => Err(Error::Busy),
                },
            };
        }
    }

    if let MutexProtocol::PriorityProtect(ceiling) = mutex_cb.protocol.get(&*lock) {
        if ceiling < running_thread.effective_priority.get(&*lock) {
            return Err(Error::BadParam);
        }
    }

    if mutex_cb.owning_thread.get(&*lock).is_none() {
        lock_core(lock, mutex_cb, running_thread);
        return Ok(LockPoll::Acquired);
    }

    if mode == LockMode::Blocking {
        detect_contention_cycle(lock, mutex_cb, running_thread)?;
    }

    Ok(LockPoll::MustBlock)
}

fn lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    deadline: Option<UTicks>,
) -> Result {
    match poll_lock(lock.borrow_mut(), mutex_cb, LockMode::Blocking)? {
        LockPoll::Acquired => Ok(()),
        LockPoll::MustBlock => {
            // The wake-upper transfers ownership to us before waking us, so a
            // successful wait needs no further action.
            match deadline {
                None => mutex_cb
                    .wait_queue
                    .wait(lock.borrow_mut(), WaitPayload::Mutex(mutex_cb)),
                Some(deadline) => {
                    if deadline <= timeout::now(lock.borrow_mut()) {
                        return Err(Error::Timeout);
                    }
                    mutex_cb.wait_queue.wait_timeout(
                        lock.borrow_mut(),
                        WaitPayload::Mutex(mutex_cb),
                        deadline,
                    )
                }
            }
        }
    }
}

/// Walk the contention chain starting at this mutex's owner; reaching the
/// prospective waiter means the lock attempt would close a cycle.
fn detect_contention_cycle<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    running_thread: &'static ThreadCb<Traits>,
) -> Result {
    let mut maybe_owner = mutex_cb.owning_thread.get(&*lock);
    let mut depth = 0;
    while let Some(owner) = maybe_owner {
        if ptr::eq(owner, running_thread) {
            return Err(Error::Deadlock);
        }

        depth += 1;
        debug_assert!(depth <= cfg::MAX_THREADS, "contention chain too deep");

        let waited_mutex = wait::with_current_wait_payload(
            lock.borrow_mut(),
            owner,
            |payload| match payload {
                Some(&WaitPayload::Mutex(waited)) => Some(waited),
                _ => None,
            },
        );
        maybe_owner = waited_mutex.and_then(|waited| waited.owning_thread.get(&*lock));
    }
    Ok(())
}

/// Give the ownership of the mutex to `thread_cb` and apply the protocol's
/// on-acquire priority effect.
///
/// The thread must be in the Running or Waiting state, and must not already
/// be counted among the mutex's waiters.
fn lock_core<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    debug_assert!(matches!(
        thread_cb.st.get(&*lock),
        thread::ThreadState::Running | thread::ThreadState::Waiting
    ));

    mutex_cb.owning_thread.replace(&mut *lock, Some(thread_cb));
    mutex_cb.recursion_count.replace(&mut *lock, 1);

    // Push `mutex_cb` onto the list of mutexes held by the thread
    let prev_mutex_held = thread_cb.last_mutex_held.replace(&mut *lock, Some(mutex_cb));
    mutex_cb.prev_mutex_held.replace(&mut *lock, prev_mutex_held);

    // A priority-protect ceiling, or the remaining waiters of a
    // priority-inheritance mutex, may raise the new owner's priority
    update_priority_of_thread(lock, thread_cb);
}

fn unlock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result {
    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    if ptr_from_option_ref(mutex_cb.owning_thread.get(&*lock)) != running_thread as *const _ {
        // The current thread does not own the mutex
        return Err(Error::NotOwner);
    }

    let count = mutex_cb.recursion_count.get(&*lock);
    debug_assert!(count >= 1);
    if count > 1 {
        mutex_cb.recursion_count.replace(&mut *lock, count - 1);
        return Ok(());
    }

    remove_held_mutex(lock.borrow_mut(), running_thread, mutex_cb);

    // Lower the thread's effective priority. This may cause preemption.
    update_priority_of_thread(lock.borrow_mut(), running_thread);

    // Wake up the next waiter
    unlock_mutex_unchecked(lock.borrow_mut(), mutex_cb);

    thread::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Transfer ownership to the next waiter, or mark the mutex free.
///
/// This method may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
fn unlock_mutex_unchecked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    // The head waiter leaves the queue before `lock_core` so that it isn't
    // counted as boosting itself through the remaining waiters
    if let Some(next_thread) = mutex_cb.wait_queue.pop_waiter(lock.borrow_mut()) {
        lock_core(lock.borrow_mut(), mutex_cb, next_thread);
        wait::complete_wait(lock.borrow_mut(), next_thread, Ok(()));
    } else {
        mutex_cb.owning_thread.replace(&mut *lock, None);
        mutex_cb.recursion_count.replace(&mut *lock, 0);
    }
}

/// Unlink `mutex_cb` from the held-mutex list of `thread_cb`. Unlock order
/// is unconstrained, so the target can be anywhere in the list.
fn remove_held_mutex<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    let target = mutex_cb as *const MutexCb<Traits>;

    if ptr_from_option_ref(thread_cb.last_mutex_held.get(&*lock)) == target {
        let prev = mutex_cb.prev_mutex_held.get(&*lock);
        thread_cb.last_mutex_held.replace(&mut *lock, prev);
    } else {
        let mut cursor = thread_cb.last_mutex_held.get(&*lock);
        while let Some(held) = cursor {
            if ptr_from_option_ref(held.prev_mutex_held.get(&*lock)) == target {
                let prev = mutex_cb.prev_mutex_held.get(&*lock);
                held.prev_mutex_held.replace(&mut *lock, prev);
                break;
            }
            cursor = held.prev_mutex_held.get(&*lock);
        }
        debug_assert!(cursor.is_some(), "mutex not on the held list");
    }

    mutex_cb.prev_mutex_held.replace(&mut *lock, None);
}

/// Release all mutexes held by an exiting thread, waking up their next
/// waiters.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    let mut maybe_mutex_cb = thread_cb.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex_cb) = maybe_mutex_cb {
        maybe_mutex_cb = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
        unlock_mutex_unchecked(lock.borrow_mut(), mutex_cb);
    }

    // With no mutexes held, the effective priority falls back to base
    let base_priority = thread_cb.base_priority.get(&*lock);
    thread_cb
        .effective_priority
        .replace(&mut *lock, base_priority);
}

/// Check if the specified mutex, which is currently held or waited for by a
/// thread, is compatible with the thread's new base priority according to
/// the mutex's locking protocol.
///
/// The check is only needed when raising the priority.
#[inline]
pub(crate) fn does_held_mutex_allow_new_base_priority<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    if let MutexProtocol::PriorityProtect(ceiling) = mutex_cb.protocol.get(&*lock) {
        if ceiling < new_base_priority {
            return false;
        }
    }
    true
}

/// Check if the thread's held mutexes are all compatible with the new base
/// priority according to the mutexes' locking protocols.
pub(crate) fn do_held_mutexes_allow_new_base_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    let mut maybe_mutex_cb = thread_cb.last_mutex_held.get(&*lock);
    while let Some(mutex_cb) = maybe_mutex_cb {
        if !does_held_mutex_allow_new_base_priority(
            lock.borrow_mut(),
            mutex_cb,
            new_base_priority,
        ) {
            return false;
        }
        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }
    true
}

/// Reevaluate the thread's effective priority and return the result. (This
/// function doesn't update `ThreadCb::effective_priority`.)
fn evaluate_thread_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) -> Priority {
    let mut effective_priority = thread_cb.base_priority.get(&*lock);
    let mut maybe_mutex_cb = thread_cb.last_mutex_held.get(&*lock);

    while let Some(mutex_cb) = maybe_mutex_cb {
        match mutex_cb.protocol.get(&*lock) {
            MutexProtocol::None => {}
            MutexProtocol::PriorityProtect(ceiling) => {
                effective_priority = effective_priority.max(ceiling);
            }
            MutexProtocol::PriorityInheritance => {
                // The wait queue is priority-sorted, so the head carries the
                // highest waiter priority
                if let Some(head) = mutex_cb.wait_queue.first_waiting_thread(lock.borrow_mut())
                {
                    effective_priority =
                        effective_priority.max(head.effective_priority.get(&*lock));
                }
            }
        }
        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }

    effective_priority
}

/// Recompute the effective priority of `thread_cb` and propagate the change
/// along its contention chain.
///
/// At each step the thread is repositioned within the ready band or wait
/// queue it occupies (to the tail of its new priority class, preserving FIFO
/// fairness), and if it is blocked on a priority-inheritance mutex the walk
/// continues with that mutex's owner. The walk stops at the first step whose
/// recomputation produces no change, bounding it by the contention chain
/// depth.
pub(crate) fn update_priority_of_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    let mut current = thread_cb;
    let mut depth = 0;

    loop {
        depth += 1;
        debug_assert!(depth <= cfg::MAX_THREADS, "contention chain too deep");

        let new_priority = evaluate_thread_effective_priority(lock.borrow_mut(), current);
        let old_priority = current.effective_priority.replace(&mut *lock, new_priority);
        if new_priority == old_priority {
            break;
        }

        match current.st.get(&*lock) {
            thread::ThreadState::Ready => {
                Traits::state().ready_queue.reorder_thread(
                    lock.borrow_mut(),
                    current,
                    new_priority,
                    old_priority,
                );
                break;
            }
            thread::ThreadState::Waiting => {
                if current.wait.link.get(&*lock).is_none() {
                    // Mid-transfer: already dequeued by a waker
                    break;
                }
                wait::reorder_wait_of_thread(lock.borrow_mut(), current);

                let next = wait::with_current_wait_payload(
                    lock.borrow_mut(),
                    current,
                    |payload| match payload {
                        Some(&WaitPayload::Mutex(waited)) => Some(waited),
                        _ => None,
                    },
                );
                match next {
                    Some(waited)
                        if matches!(
                            waited.protocol.get(&*lock),
                            MutexProtocol::PriorityInheritance
                        ) =>
                    {
                        let owner = waited.owning_thread.get(&*lock);
                        debug_assert!(owner.is_some(), "contended mutex has no owner");
                        match owner {
                            Some(owner) => current = owner,
                            None => break,
                        }
                    }
                    _ => break,
                }
            }
            // Running: the value change suffices; the caller decides whether
            // a preemption check is due. Created/Terminated: not queued.
            _ => break,
        }
    }
}

/// A waiter joined the queue of `mutex_cb` (or rose in priority); re-boost
/// the owner chain if the protocol calls for it.
pub(crate) fn on_waiter_added<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    reevaluate_owner(lock, mutex_cb);
}

/// A waiter left the queue of `mutex_cb` (timeout rewind); the owner may
/// deserve a lower effective priority now.
pub(crate) fn on_waiter_removed<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    reevaluate_owner(lock, mutex_cb);
}

fn reevaluate_owner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    if !matches!(
        mutex_cb.protocol.get(&*lock),
        MutexProtocol::PriorityInheritance
    ) {
        return;
    }
    if let Some(owner) = mutex_cb.owning_thread.get(&*lock) {
        update_priority_of_thread(lock, owner);
    }
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        ptr::null()
    }
}
