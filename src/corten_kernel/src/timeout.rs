//! The timed-wait engine and the system clock.
//!
//! A single kernel-global queue, sorted by deadline ascending (ties FIFO),
//! holds every thread with an outstanding deadline: sleepers and timed
//! blockers alike. The tick handler pops entries whose deadline has arrived
//! and dispatches each expiry according to the thread's wait payload. Ticks
//! are absolute 64-bit counts, so deadline comparison is plain integer
//! ordering and wrap-around never occurs during the system lifetime.
use crate::{
    cfg::QUANTUM_TICKS,
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, thread,
    utils::{
        intrusive_list::{Link, ListAccessor, ListHead},
        Init,
    },
    wait::{self, WaitPayload},
    Error, KernelTraits, PortThreading, PortTimer, Result, ThreadCb, UTicks,
};

/// Kernel-global state of the timed-wait engine.
pub(crate) struct TimeoutGlobals<Traits: PortThreading> {
    /// Set once by `boot`; scheduling and tick processing are inert before
    /// that.
    clock_initialized: CpuLockCell<Traits, bool>,

    /// The queue of outstanding deadlines, sorted by `timeout_at` ascending,
    /// FIFO among equal deadlines.
    sleep_queue: CpuLockCell<Traits, ListHead<Traits>>,

    /// Ticks left in the running thread's round-robin quantum.
    quantum_remaining: CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for TimeoutGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        clock_initialized: Init::INIT,
        sleep_queue: Init::INIT,
        quantum_remaining: CpuLockCell::new(QUANTUM_TICKS),
    };
}

fn sleep_link<Traits: PortThreading>(
    thread_cb: &ThreadCb<Traits>,
) -> &CpuLockCell<Traits, Option<Link<Traits>>> {
    &thread_cb.sleep_link
}

fn sleep_queue_accessor<Traits: KernelTraits>() -> ListAccessor<'static, Traits> {
    ListAccessor::new(&Traits::state().timeout.sleep_queue, sleep_link)
}

pub(crate) fn init_clock<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    Traits::state()
        .timeout
        .clock_initialized
        .replace(&mut *lock, true);
}

pub(crate) fn is_clock_initialized<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    Traits::state().timeout.clock_initialized.get(&*lock)
}

/// Read the current tick count.
#[inline]
pub(crate) fn now<Traits: KernelTraits>(_lock: CpuLockTokenRefMut<'_, Traits>) -> UTicks {
    // Safety: we are the kernel; the lock token serializes us with the tick
    // interrupt
    unsafe { Traits::tick_count() }
}

/// Public clock access.
pub mod time {
    use super::*;

    /// Get the current value of the monotonic tick clock.
    pub fn now<Traits: KernelTraits>() -> Result<UTicks> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(super::now(lock.borrow_mut()))
    }
}

/// Register a deadline for the current timed wait of `thread_cb` and insert
/// it into the timed-wait queue, reprogramming the port timer if it became
/// the earliest deadline.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
    deadline: UTicks,
) {
    debug_assert!(thread_cb.timeout_at.get(&*lock).is_none());
    thread_cb.timeout_at.replace(&mut *lock, Some(deadline));

    let accessor = sleep_queue_accessor::<Traits>();
    let mut insert_at = accessor.first(lock.borrow_mut());
    while let Some(other) = insert_at {
        let other_deadline = other.timeout_at.get(&*lock).unwrap();
        if other_deadline > deadline {
            break;
        }
        insert_at = accessor.next(lock.borrow_mut(), other);
    }
    accessor.insert_before(lock.borrow_mut(), thread_cb, insert_at);

    let is_new_head = accessor
        .first(lock.borrow_mut())
        .is_some_and(|first| core::ptr::eq(first, thread_cb));
    if is_new_head {
        let current = now(lock.borrow_mut());
        // Safety: kernel calling its own port
        unsafe { Traits::pend_tick_after(deadline.saturating_sub(current).max(1)) };
    }
}

/// Unregister the deadline of `thread_cb`, if it still has one.
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    if thread_cb.timeout_at.replace(&mut *lock, None).is_some()
        && thread_cb.sleep_link.get(&*lock).is_some()
    {
        sleep_queue_accessor::<Traits>().remove(lock.borrow_mut(), thread_cb);
    }
}

/// Reset the round-robin quantum. Called whenever a thread is dispatched.
pub(crate) fn reset_quantum<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    Traits::state()
        .timeout
        .quantum_remaining
        .replace(&mut *lock, QUANTUM_TICKS);
}

/// Implements `sleep_until`.
pub(crate) fn sleep_until_tick<Traits: KernelTraits>(deadline: UTicks) -> Result {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_thread_context::<Traits>()?;

    if deadline <= now(lock.borrow_mut()) {
        return Ok(());
    }

    match wait::wait_no_queue_timeout(lock.borrow_mut(), WaitPayload::Sleep, deadline) {
        // Expiry is the natural way a sleep ends
        Err(Error::Timeout) => Ok(()),
        Ok(()) => unreachable!("sleep completed without expiring"),
        Err(e) => Err(e),
    }
}

/// The tick handler: expire due timed waits in deadline order, account the
/// round-robin quantum, reprogram the next tick, and check for preemption.
pub(crate) fn handle_tick<Traits: KernelTraits>(mut lock: CpuLockGuard<Traits>) {
    let current = now(lock.borrow_mut());

    let accessor = sleep_queue_accessor::<Traits>();
    while let Some(head) = accessor.first(lock.borrow_mut()) {
        let deadline = head.timeout_at.get(&*lock).unwrap();
        if deadline > current {
            break;
        }
        accessor.remove(lock.borrow_mut(), head);
        head.timeout_at.replace(&mut *lock, None);
        wait::complete_expired_wait(lock.borrow_mut(), head);
    }

    // Round-robin: when the quantum runs out and a peer of the running
    // thread's effective priority is Ready, rotate the running thread to the
    // tail of its band.
    let quantum = Traits::state().timeout.quantum_remaining.get(&*lock);
    if quantum <= 1 {
        reset_quantum(lock.borrow_mut());
        if let Some(running_thread) = Traits::state().running_thread(lock.borrow_mut()) {
            if running_thread.st.get(&*lock) == thread::ThreadState::Running {
                let priority = running_thread.effective_priority.get(&*lock);
                if Traits::state()
                    .ready_queue
                    .has_ready_thread_at(lock.borrow_mut(), priority)
                {
                    // Safety: the previous state is Running
                    unsafe { thread::make_ready(lock.borrow_mut(), running_thread) };
                }
            }
        }
    } else {
        Traits::state()
            .timeout
            .quantum_remaining
            .replace(&mut *lock, quantum - 1);
    }

    if let Some(head) = sleep_queue_accessor::<Traits>().first(lock.borrow_mut()) {
        let deadline = head.timeout_at.get(&*lock).unwrap();
        // Safety: kernel calling its own port
        unsafe { Traits::pend_tick_after(deadline.saturating_sub(current).max(1)) };
    }

    thread::unlock_cpu_and_check_preemption(lock);
}
