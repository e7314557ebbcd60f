//! The thread ready queue: one FIFO list per priority level plus a bitmap of
//! non-empty levels, giving O(1) selection of the most urgent Ready thread.
use crate::{
    cfg::PRIORITY_LEVELS,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    thread::ThreadCb,
    utils::{
        intrusive_list::{Link, ListAccessor, ListHead},
        Init, PrioBitmap,
    },
    KernelTraits, PortThreading, Priority,
};

/// The result type of [`BitmapReadyQueue::pop_front_thread`].
pub(crate) enum ScheduleDecision<T> {
    /// The kernel should not perform a context switch and should continue to
    /// schedule the current thread.
    Keep,
    /// The kernel should perform a context switch to the specified thread
    /// (`None` = idle until the next interrupt).
    SwitchTo(Option<T>),
}

/// The set of segregated ready lists, in which each list stores the Ready
/// threads of the corresponding effective priority.
///
/// Invariant: `queues[i].first.is_some() == bitmap.get(i)`.
pub(crate) struct BitmapReadyQueue<Traits: PortThreading> {
    queues: [CpuLockCell<Traits, ListHead<Traits>>; PRIORITY_LEVELS],
    bitmap: CpuLockCell<Traits, PrioBitmap>,
}

impl<Traits: PortThreading> Init for BitmapReadyQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

fn ready_link<Traits: PortThreading>(
    thread_cb: &ThreadCb<Traits>,
) -> &CpuLockCell<Traits, Option<Link<Traits>>> {
    &thread_cb.ready_link
}

impl<Traits: KernelTraits> BitmapReadyQueue<Traits> {
    #[inline]
    fn accessor(&self, priority: Priority) -> ListAccessor<'_, Traits> {
        ListAccessor::new(&self.queues[priority as usize], ready_link)
    }

    /// Return a flag indicating whether there is a Ready thread whose
    /// effective priority exceeds `priority`. `priority == None` stands for
    /// "no schedulable current thread" and makes any Ready thread qualify.
    #[inline]
    pub(crate) fn has_ready_thread_above(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        priority: Option<Priority>,
    ) -> bool {
        match self.bitmap.read(&*lock).find_highest_set() {
            Some(highest) => priority.map_or(true, |p| highest > p as usize),
            None => false,
        }
    }

    /// Return a flag indicating whether a Ready thread exists at exactly
    /// `priority` (a round-robin peer of a running thread of that priority).
    #[inline]
    pub(crate) fn has_ready_thread_at(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        priority: Priority,
    ) -> bool {
        self.bitmap.read(&*lock).get(priority as usize)
    }

    /// Insert `thread_cb` at the back of the ready list of its effective
    /// priority.
    pub(crate) fn push_back_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread_cb: &'static ThreadCb<Traits>,
    ) {
        let priority = thread_cb.effective_priority.get(&*lock);
        self.accessor(priority).push_back(lock.borrow_mut(), thread_cb);
        self.bitmap.write(&mut *lock).set(priority as usize);
    }

    /// Choose the next thread to schedule based on `prev_priority`, the
    /// effective priority of the thread that would keep running if this
    /// decision requests no switch (`None` when there is no such thread).
    ///
    /// A Ready thread is chosen — and removed from the queue — only if it
    /// outranks `prev_priority`; a thread of merely equal priority does not
    /// preempt. With `prev_priority == None` this always returns
    /// `SwitchTo(_)`, possibly `SwitchTo(None)` when the system should idle.
    pub(crate) fn pop_front_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prev_priority: Option<Priority>,
    ) -> ScheduleDecision<&'static ThreadCb<Traits>> {
        let next_priority = self.bitmap.read(&*lock).find_highest_set();

        match (next_priority, prev_priority) {
            (Some(next), prev) if prev.map_or(true, |p| next > p as usize) => {
                let accessor = self.accessor(next as Priority);
                let thread_cb = accessor.pop_front(lock.borrow_mut()).unwrap();
                if accessor.is_empty(lock.borrow_mut()) {
                    self.bitmap.write(&mut *lock).clear(next);
                }
                ScheduleDecision::SwitchTo(Some(thread_cb))
            }
            (None, None) => ScheduleDecision::SwitchTo(None),
            _ => ScheduleDecision::Keep,
        }
    }

    /// Remove `thread_cb` from the ready queue (e.g. because it is being
    /// scheduled around the normal selection path).
    pub(crate) fn remove_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread_cb: &'static ThreadCb<Traits>,
    ) {
        let priority = thread_cb.effective_priority.get(&*lock);
        let accessor = self.accessor(priority);
        accessor.remove(lock.borrow_mut(), thread_cb);
        if accessor.is_empty(lock.borrow_mut()) {
            self.bitmap.write(&mut *lock).clear(priority as usize);
        }
    }

    /// Reposition `thread_cb` after a change of its effective priority from
    /// `old_priority` to `priority`: it leaves its old band and joins the
    /// back of the new one, preserving FIFO fairness among its new peers.
    pub(crate) fn reorder_thread(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread_cb: &'static ThreadCb<Traits>,
        priority: Priority,
        old_priority: Priority,
    ) {
        debug_assert_ne!(priority, old_priority);

        let old_accessor = self.accessor(old_priority);
        old_accessor.remove(lock.borrow_mut(), thread_cb);
        let old_empty = old_accessor.is_empty(lock.borrow_mut());

        self.accessor(priority).push_back(lock.borrow_mut(), thread_cb);

        let bitmap = self.bitmap.write(&mut *lock);
        bitmap.set(priority as usize);
        if old_empty {
            bitmap.clear(old_priority as usize);
        }
    }
}
