//! The blocking-on-event primitive shared by all synchronization objects.
//!
//! A [`WaitQueue`] is an intrusive thread list kept sorted by effective
//! priority, descending, with FIFO order among equal priorities: a new waiter
//! is inserted after the last existing waiter of greater-or-equal priority,
//! and a waiter whose priority changes is removed and re-inserted under the
//! same rule. A thread appears in a wait queue iff its state is `Waiting`
//! with a wait payload designating the owning object. Only the scheduler
//! mutates wait queues, always under CPU Lock.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    mutex, semaphore, thread, timeout,
    utils::{
        intrusive_list::{Link, ListAccessor, ListHead},
        Init,
    },
    Error, KernelTraits, PortThreading, Result, ThreadCb, UTicks,
};

/// What a `Waiting` thread is waiting for. Doubles as the back-reference from
/// the waiter to the owning object, used by timeout expiry and priority
/// reordering.
pub(crate) enum WaitPayload<Traits: PortThreading> {
    /// `sleep_until` — no wait queue, wake comes from the timed-wait engine
    /// alone.
    Sleep,
    Mutex(&'static mutex::MutexCb<Traits>),
    Semaphore(&'static semaphore::SemaphoreCb<Traits>),
    Join(&'static ThreadCb<Traits>),
}

impl<Traits: PortThreading> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for WaitPayload<Traits> {}

/// The wait state embedded in each TCB.
pub(crate) struct ThreadWait<Traits: PortThreading> {
    /// Links this thread into the owning object's wait queue. `None` while
    /// the thread is not on any wait queue.
    pub(crate) link: CpuLockCell<Traits, Option<Link<Traits>>>,

    /// The payload of the current wait. `Some` iff the thread is `Waiting`.
    pub(crate) payload: CpuLockCell<Traits, Option<WaitPayload<Traits>>>,

    /// The completion value of the current wait, set by the waker before the
    /// thread is made Ready again.
    pub(crate) result: CpuLockCell<Traits, Result>,
}

impl<Traits: PortThreading> Init for ThreadWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        link: Init::INIT,
        payload: Init::INIT,
        result: Init::INIT,
    };
}

/// A wait queue: the priority-ordered list of threads blocked on one
/// synchronization object.
pub(crate) struct WaitQueue<Traits: PortThreading> {
    head: CpuLockCell<Traits, ListHead<Traits>>,
}

// Safety: the head cell is only reachable through the CPU Lock token
unsafe impl<Traits: PortThreading> Sync for WaitQueue<Traits> {}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { head: Init::INIT };
}

fn wait_link<Traits: PortThreading>(
    thread_cb: &ThreadCb<Traits>,
) -> &CpuLockCell<Traits, Option<Link<Traits>>> {
    &thread_cb.wait.link
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    #[inline]
    fn accessor(&self) -> ListAccessor<'_, Traits> {
        ListAccessor::new(&self.head, wait_link)
    }

    /// Get the next thread to be woken up, i.e. the highest-priority,
    /// earliest-enqueued waiter.
    #[inline]
    pub(crate) fn first_waiting_thread(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        self.accessor().first(lock)
    }

    /// Insert `thread_cb` after the last waiter whose effective priority is
    /// greater than or equal to its own.
    pub(crate) fn insert_ordered(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread_cb: &'static ThreadCb<Traits>,
    ) {
        let priority = thread_cb.effective_priority.get(&*lock);
        let accessor = self.accessor();

        let mut insert_at = accessor.first(lock.borrow_mut());
        while let Some(other) = insert_at {
            if other.effective_priority.get(&*lock) < priority {
                break;
            }
            insert_at = accessor.next(lock.borrow_mut(), other);
        }
        accessor.insert_before(lock.borrow_mut(), thread_cb, insert_at);
    }

    /// Block the current thread on this queue until it is woken up by the
    /// owning object. Returns the completion value assigned by the waker.
    pub(crate) fn wait(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result {
        let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

        running_thread.wait.payload.replace(&mut *lock, Some(payload));
        running_thread.wait.result.replace(&mut *lock, Ok(()));
        self.insert_ordered(lock.borrow_mut(), running_thread);

        // A new waiter may raise the effective priority of a
        // priority-inheritance mutex owner, transitively.
        if let WaitPayload::Mutex(mutex_cb) = payload {
            mutex::on_waiter_added(lock.borrow_mut(), mutex_cb);
        }

        thread::wait_until_woken_up(lock.borrow_mut());

        running_thread.wait.result.get(&*lock)
    }

    /// Like [`Self::wait`], but also registers the wait with the timed-wait
    /// engine; expiry completes the wait with [`Error::Timeout`].
    pub(crate) fn wait_timeout(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        deadline: UTicks,
    ) -> Result {
        let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

        running_thread.wait.payload.replace(&mut *lock, Some(payload));
        running_thread.wait.result.replace(&mut *lock, Ok(()));
        self.insert_ordered(lock.borrow_mut(), running_thread);
        timeout::insert_timeout(lock.borrow_mut(), running_thread, deadline);

        if let WaitPayload::Mutex(mutex_cb) = payload {
            mutex::on_waiter_added(lock.borrow_mut(), mutex_cb);
        }

        thread::wait_until_woken_up(lock.borrow_mut());

        // The expiry path removed the timeout; cancel it if the wake-up came
        // from the object instead.
        timeout::remove_timeout(lock.borrow_mut(), running_thread);

        running_thread.wait.result.get(&*lock)
    }

    /// Remove the head waiter from the queue without completing its wait.
    /// Used by the mutex ownership transfer, which must update ownership
    /// before the waiter is made Ready.
    pub(crate) fn pop_waiter(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        self.accessor().pop_front(lock.borrow_mut())
    }

    /// Wake up the head waiter, completing its wait with `Ok`. Returns
    /// `false` if the queue was empty.
    pub(crate) fn wake_up_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        if let Some(thread_cb) = self.accessor().pop_front(lock.borrow_mut()) {
            complete_wait(lock, thread_cb, Ok(()));
            true
        } else {
            false
        }
    }

    /// Wake up all waiters.
    pub(crate) fn wake_up_all(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        while self.wake_up_one(lock.borrow_mut()) {}
    }
}

/// Block the current thread without joining any wait queue; only the
/// timed-wait engine can end the wait. Used by `sleep_until`.
pub(crate) fn wait_no_queue_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    deadline: UTicks,
) -> Result {
    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    running_thread.wait.payload.replace(&mut *lock, Some(payload));
    running_thread.wait.result.replace(&mut *lock, Ok(()));
    timeout::insert_timeout(lock.borrow_mut(), running_thread, deadline);

    thread::wait_until_woken_up(lock.borrow_mut());

    timeout::remove_timeout(lock.borrow_mut(), running_thread);

    running_thread.wait.result.get(&*lock)
}

/// Complete the wait of `thread_cb` (already removed from its wait queue, if
/// any) with the given result and make it Ready.
pub(crate) fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
    result: Result,
) {
    debug_assert!(thread_cb.wait.link.get(&*lock).is_none());

    thread_cb.wait.payload.replace(&mut *lock, None);
    thread_cb.wait.result.replace(&mut *lock, result);
    timeout::remove_timeout(lock.borrow_mut(), thread_cb);

    // Safety: the thread was Waiting, so this is a legal transition
    unsafe { thread::make_ready(lock, thread_cb) };
}

/// Timed-wait expiry: remove `thread_cb` from the wait queue designated by
/// its payload, rewind any priority-inheritance influence it exerted, and
/// complete the wait with [`Error::Timeout`].
///
/// The caller (the timed-wait engine) has already unregistered the timeout.
pub(crate) fn complete_expired_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    let payload = thread_cb
        .wait
        .payload
        .get(&*lock)
        .expect("expired thread has no wait payload");

    match payload {
        WaitPayload::Sleep => {}
        WaitPayload::Mutex(mutex_cb) => {
            mutex_cb.wait_queue.accessor().remove(lock.borrow_mut(), thread_cb);
        }
        WaitPayload::Semaphore(semaphore_cb) => {
            semaphore_cb
                .wait_queue
                .accessor()
                .remove(lock.borrow_mut(), thread_cb);
        }
        WaitPayload::Join(target) => {
            target
                .join_wait_queue
                .accessor()
                .remove(lock.borrow_mut(), thread_cb);
        }
    }

    thread_cb.wait.payload.replace(&mut *lock, None);
    thread_cb.wait.result.replace(&mut *lock, Err(Error::Timeout));

    // Safety: the thread was Waiting
    unsafe { thread::make_ready(lock.borrow_mut(), thread_cb) };

    // With the waiter gone, the owner of a priority-inheritance mutex may
    // deserve a lower effective priority.
    if let WaitPayload::Mutex(mutex_cb) = payload {
        mutex::on_waiter_removed(lock, mutex_cb);
    }
}

/// Re-sort a `Waiting` thread within its wait queue after a change of its
/// effective priority. The thread keeps FIFO fairness among its new peers
/// (it is placed after the last waiter of greater-or-equal priority).
pub(crate) fn reorder_wait_of_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    let queue = match thread_cb.wait.payload.get(&*lock) {
        Some(WaitPayload::Mutex(mutex_cb)) => &mutex_cb.wait_queue,
        Some(WaitPayload::Semaphore(semaphore_cb)) => &semaphore_cb.wait_queue,
        Some(WaitPayload::Join(target)) => &target.join_wait_queue,
        Some(WaitPayload::Sleep) | None => return,
    };

    queue.accessor().remove(lock.borrow_mut(), thread_cb);
    queue.insert_ordered(lock.borrow_mut(), thread_cb);
}

/// Apply `f` to the wait payload of `thread_cb` (or `None` if it is not
/// waiting).
pub(crate) fn with_current_wait_payload<Traits: KernelTraits, R>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    f(thread_cb.wait.payload.read(&*lock).as_ref())
}
