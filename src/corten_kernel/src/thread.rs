//! Threads.
use core::{fmt, marker::PhantomData, mem, ptr};

use crate::{
    cfg::MAX_THREADS,
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, state, timeout,
    utils::{intrusive_list::Link, Init},
    wait::{self, WaitPayload},
    Error, Id, KernelTraits, PortThreading, Priority, Result, UTicks,
};

pub(crate) mod readyqueue;
use readyqueue::ScheduleDecision;

pub(super) type ThreadId = Id;

/// How many low bits of a [`ThreadId`] hold `slot + 1`; the rest hold the
/// slot generation.
const ID_SLOT_BITS: u32 = 8;

const _: () = assert!(MAX_THREADS < (1 << ID_SLOT_BITS));

fn make_thread_id(slot: usize, generation: u32) -> ThreadId {
    ThreadId::new((generation as usize) << ID_SLOT_BITS | (slot + 1)).unwrap()
}

/// The entry point of a thread and the argument passed to it.
#[derive(Clone, Copy)]
pub(crate) struct ThreadEntry {
    pub entry: fn(usize),
    pub param: usize,
}

/// The stack region owned by a thread, as handed out by the port's stack
/// provider.
#[derive(Clone, Copy)]
pub(crate) struct StackRegion {
    pub ptr: *mut u8,
    pub size: usize,
}

impl Init for StackRegion {
    const INIT: Self = Self {
        ptr: ptr::null_mut(),
        size: 0,
    };
}

/// Thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// The TCB slot is unallocated.
    Vacant,
    /// The thread exists but has not been started.
    Created,
    /// The thread is runnable and on the ready queue.
    Ready,
    /// The thread is the running thread.
    Running,
    /// The thread is blocked on a wait queue and/or the timed-wait queue.
    Waiting,
    /// The thread's entry function returned; the storage is retained until
    /// `join` (unless detached).
    Terminated,
}

impl Init for ThreadState {
    const INIT: Self = Self::Vacant;
}

/// *Thread control block* — the state data of a thread, one arena slot each.
#[repr(C)]
pub struct ThreadCb<Traits: PortThreading> {
    /// Port-specific context state.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so that
    /// assembler code can refer to it easily.
    pub port_thread_state: Traits::PortThreadState,

    pub(crate) st: CpuLockCell<Traits, ThreadState>,

    /// The thread's configured priority, not affected by locking protocols.
    pub(crate) base_priority: CpuLockCell<Traits, Priority>,

    /// The priority used for scheduling and wait-queue ordering:
    /// `max(base_priority, boosts)`, where the boosts come from the locking
    /// protocols of held mutexes. Always ≥ `base_priority`.
    ///
    /// The effective priority determines the thread's position within the
    /// ready queue; [`readyqueue::BitmapReadyQueue::reorder_thread`] must be
    /// called after updating this for a Ready thread, and
    /// [`wait::reorder_wait_of_thread`] for a Waiting one.
    pub(crate) effective_priority: CpuLockCell<Traits, Priority>,

    pub(crate) entry: CpuLockCell<Traits, Option<ThreadEntry>>,
    pub(crate) stack: CpuLockCell<Traits, StackRegion>,

    /// Incremented whenever the slot is reclaimed, invalidating outstanding
    /// [`ThreadId`]s that refer to the slot's previous occupant.
    pub(crate) generation: CpuLockCell<Traits, u32>,

    pub(crate) detached: CpuLockCell<Traits, bool>,

    /// Links this thread into its priority's ready list while Ready.
    pub(crate) ready_link: CpuLockCell<Traits, Option<Link<Traits>>>,

    /// The wait state (wait-queue link, payload, completion value).
    pub(crate) wait: wait::ThreadWait<Traits>,

    /// Links this thread into the timed-wait queue while it has a deadline.
    pub(crate) sleep_link: CpuLockCell<Traits, Option<Link<Traits>>>,

    /// The deadline of the current timed wait, if any.
    pub(crate) timeout_at: CpuLockCell<Traits, Option<UTicks>>,

    /// The last mutex locked by the thread; heads the singly-linked list of
    /// all mutexes it currently holds (chained through
    /// `MutexCb::prev_mutex_held`).
    pub(crate) last_mutex_held: CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    /// Threads blocked in `join` on this thread.
    pub(crate) join_wait_queue: wait::WaitQueue<Traits>,
}

// Safety: every interior-mutable field is a `CpuLockCell`, reachable only
// through the singleton CPU Lock token, and `PortThreadState` is `Sync` by
// its trait bound.
unsafe impl<Traits: PortThreading> Sync for ThreadCb<Traits> {}

impl<Traits: PortThreading> Init for ThreadCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_thread_state: Traits::PORT_THREAD_STATE_INIT,
        st: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        entry: Init::INIT,
        stack: Init::INIT,
        generation: CpuLockCell::new(1),
        detached: Init::INIT,
        ready_link: Init::INIT,
        wait: Init::INIT,
        sleep_link: Init::INIT,
        timeout_at: Init::INIT,
        last_mutex_held: Init::INIT,
        join_wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> ThreadCb<Traits> {
    /// The index of this TCB within the arena.
    pub fn slot(&self) -> usize {
        let offset_bytes =
            self as *const Self as usize - Traits::state().threads.as_ptr() as usize;
        offset_bytes / mem::size_of::<Self>()
    }

    pub(crate) fn thread_id(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> ThreadId {
        make_thread_id(self.slot(), self.generation.get(&*lock))
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("slot", &self.slot())
            .field("st", &self.st)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .finish_non_exhaustive()
    }
}

/// Resolve a [`ThreadId`] against the arena, checking the slot generation so
/// stale handles are rejected.
pub(crate) fn thread_cb<Traits: KernelTraits>(
    this: ThreadId,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static ThreadCb<Traits>> {
    let raw = this.get();
    let slot = (raw & ((1 << ID_SLOT_BITS) - 1)) - 1;
    let generation = (raw >> ID_SLOT_BITS) as u32;

    let thread_cb = Traits::state()
        .threads
        .get(slot)
        .ok_or(Error::BadParam)?;
    if thread_cb.generation.get(&*lock) != generation
        || thread_cb.st.get(&*lock) == ThreadState::Vacant
    {
        return Err(Error::BadParam);
    }
    Ok(thread_cb)
}

/// An owned handle to a thread.
pub struct Thread<Traits> {
    id: ThreadId,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for Thread<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for Thread<Traits> {}
impl<Traits> PartialEq for Thread<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<Traits> Eq for Thread<Traits> {}

impl<Traits> fmt::Debug for Thread<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Thread").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Thread<Traits> {
    /// Create a thread in the `Created` state.
    ///
    /// `stack_size` bytes of stack are requested from the port's stack
    /// provider ([`Error::NoMemory`] on failure); the TCB comes from the
    /// fixed arena ([`Error::WouldBlock`] when no slot is vacant). The thread
    /// does not run until [`start`](Self::start) is called.
    pub fn spawn(
        stack_size: usize,
        priority: Priority,
        entry: fn(usize),
        param: usize,
    ) -> Result<Self> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let thread_cb = Traits::state()
            .threads
            .iter()
            .find(|thread_cb| thread_cb.st.get(&*lock) == ThreadState::Vacant)
            .ok_or(Error::WouldBlock)?;

        // Safety: the region is recorded in the TCB and released on reclaim
        let stack_ptr =
            unsafe { Traits::allocate_stack(stack_size) }.ok_or(Error::NoMemory)?;

        thread_cb.st.replace(&mut *lock, ThreadState::Created);
        thread_cb.base_priority.replace(&mut *lock, priority);
        thread_cb.effective_priority.replace(&mut *lock, priority);
        thread_cb
            .entry
            .replace(&mut *lock, Some(ThreadEntry { entry, param }));
        thread_cb.stack.replace(
            &mut *lock,
            StackRegion {
                ptr: stack_ptr,
                size: stack_size,
            },
        );
        thread_cb.detached.replace(&mut *lock, false);

        let id = thread_cb.thread_id(lock.borrow_mut());
        Ok(Self {
            id,
            _phantom: PhantomData,
        })
    }

    /// Make a `Created` thread Runnable. May preempt the caller if the new
    /// thread's effective priority exceeds the caller's.
    pub fn start(self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread_cb = thread_cb::<Traits>(self.id, lock.borrow_mut())?;

        if thread_cb.st.get(&*lock) != ThreadState::Created {
            return Err(Error::BadParam);
        }

        // Safety: CPU Lock active, the thread is in the Created state
        unsafe { Traits::initialize_thread_state(thread_cb) };

        // Safety: the previous state is Created, and the context state was
        // just initialized, so this is safe
        unsafe { make_ready(lock.borrow_mut(), thread_cb) };

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wait until the thread terminates, then release its TCB slot and
    /// stack. Joining the current thread fails with [`Error::Deadlock`]; a
    /// thread that was already joined or detached is a stale handle and fails
    /// with [`Error::BadParam`].
    pub fn join(self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;

        loop {
            let thread_cb = thread_cb::<Traits>(self.id, lock.borrow_mut())?;
            let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
            if ptr::eq(thread_cb, running_thread) {
                return Err(Error::Deadlock);
            }

            match thread_cb.st.get(&*lock) {
                ThreadState::Terminated => {
                    reclaim_thread(lock.borrow_mut(), thread_cb);
                    return Ok(());
                }
                _ => {
                    thread_cb
                        .join_wait_queue
                        .wait(lock.borrow_mut(), WaitPayload::Join(thread_cb))?;
                    // Re-resolve: another joiner may have won the reclaim
                }
            }
        }
    }

    /// Mark the thread so that its storage is released as soon as it
    /// terminates (immediately, if it already has).
    pub fn detach(self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread_cb = thread_cb::<Traits>(self.id, lock.borrow_mut())?;

        if thread_cb.st.get(&*lock) == ThreadState::Terminated {
            reclaim_thread(lock.borrow_mut(), thread_cb);
        } else {
            thread_cb.detached.replace(&mut *lock, true);
        }
        Ok(())
    }

    /// Get the thread's base priority.
    pub fn priority(self) -> Result<Priority> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread_cb = thread_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(thread_cb.base_priority.get(&*lock))
    }

    /// Get the thread's effective priority.
    pub fn effective_priority(self) -> Result<Priority> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread_cb = thread_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(thread_cb.effective_priority.get(&*lock))
    }

    /// Change the thread's base priority. Takes effect synchronously: the
    /// thread's position in its ready band or wait queue, and the effective
    /// priorities along any contention chain it participates in, are fully
    /// updated before this returns.
    pub fn set_priority(self, priority: Priority) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread_cb = thread_cb::<Traits>(self.id, lock.borrow_mut())?;
        set_thread_base_priority(lock, thread_cb, priority)
    }

    /// The current state of the thread, as the public five-state view.
    pub fn state(self) -> Result<ThreadState> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread_cb = thread_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(thread_cb.st.get(&*lock))
    }
}

#[cfg(test)]
impl<Traits: KernelTraits> Thread<Traits> {
    /// Resolve the handle to its TCB (test support).
    pub(crate) fn cb(self) -> &'static ThreadCb<Traits> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        thread_cb::<Traits>(self.id, lock.borrow_mut()).unwrap()
    }
}

/// Services operating on the calling thread.
pub mod this_thread {
    use super::*;

    /// Get a handle to the calling thread.
    pub fn current<Traits: KernelTraits>() -> Result<Thread<Traits>> {
        state::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
        let id = running_thread.thread_id(lock.borrow_mut());
        Ok(Thread {
            id,
            _phantom: PhantomData,
        })
    }

    /// Yield the processor to the next Ready thread of the caller's
    /// effective priority, if any; no-op otherwise.
    pub fn yield_now<Traits: KernelTraits>() -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;

        let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
        let priority = running_thread.effective_priority.get(&*lock);
        if !Traits::state()
            .ready_queue
            .has_ready_thread_at(lock.borrow_mut(), priority)
        {
            return Ok(());
        }

        // Move the caller to the tail of its band; the dispatch below picks
        // the peer at the head.
        // Safety: the previous state is Running
        unsafe { make_ready(lock.borrow_mut(), running_thread) };
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Block the calling thread until the given tick. Returns `Ok`
    /// immediately, without yielding, if `deadline` has already passed.
    pub fn sleep_until<Traits: KernelTraits>(deadline: UTicks) -> Result {
        timeout::sleep_until_tick::<Traits>(deadline)
    }

    /// Block the calling thread for `delta` ticks.
    pub fn sleep_for<Traits: KernelTraits>(delta: UTicks) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let deadline = timeout::now(lock.borrow_mut()).saturating_add(delta);
        drop(lock);
        timeout::sleep_until_tick::<Traits>(deadline)
    }

    /// Get the calling thread's base priority.
    pub fn priority<Traits: KernelTraits>() -> Result<Priority> {
        state::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
        Ok(running_thread.base_priority.get(&*lock))
    }

    /// Get the calling thread's effective priority.
    pub fn effective_priority<Traits: KernelTraits>() -> Result<Priority> {
        state::expect_thread_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
        Ok(running_thread.effective_priority.get(&*lock))
    }
}

/// The body every port runs on behalf of a newly dispatched thread: invoke
/// the entry function, then retire the thread.
///
/// # Safety
///
/// Must be called exactly once per `start`, from the context the port
/// established for `thread_cb`, after the kernel dispatched it.
pub unsafe fn run_thread_body<Traits: KernelTraits>(thread_cb: &'static ThreadCb<Traits>) {
    let entry = {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        debug_assert_eq!(thread_cb.st.get(&*lock), ThreadState::Running);
        thread_cb.entry.get(&*lock).unwrap()
    };

    (entry.entry)(entry.param);

    exit_current_thread::<Traits>();
}

/// Retire the calling thread: release held mutexes, wake joiners, transition
/// to `Terminated` (reclaiming immediately if detached), and dispatch the
/// next thread.
fn exit_current_thread<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();

    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    // Release mutexes the entry function failed to unlock, waking up their
    // next waiters (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_thread);
    debug_assert!(running_thread.last_mutex_held.get(&*lock).is_none());

    debug_assert_eq!(running_thread.st.get(&*lock), ThreadState::Running);
    running_thread.st.replace(&mut *lock, ThreadState::Terminated);

    running_thread
        .join_wait_queue
        .wake_up_all(lock.borrow_mut());

    Traits::state().running_thread.replace(&mut *lock, None);

    if running_thread.detached.get(&*lock) {
        reclaim_thread(lock.borrow_mut(), running_thread);
    }

    drop(lock);

    // Safety: the thread has been removed from scheduling; we are its context
    unsafe { Traits::exit_and_dispatch(running_thread) };
}

/// Release the TCB slot and stack of a `Terminated` thread.
fn reclaim_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    debug_assert_eq!(thread_cb.st.get(&*lock), ThreadState::Terminated);
    debug_assert!(thread_cb.ready_link.get(&*lock).is_none());
    debug_assert!(thread_cb.wait.link.get(&*lock).is_none());
    debug_assert!(thread_cb.sleep_link.get(&*lock).is_none());

    // Safety: CPU Lock active, the thread is retired
    unsafe { Traits::reclaim_thread_state(thread_cb) };

    let stack = thread_cb.stack.replace(&mut *lock, StackRegion::INIT);
    if !stack.ptr.is_null() {
        // Safety: the region came from `allocate_stack` and its owner is gone
        unsafe { Traits::deallocate_stack(stack.ptr, stack.size) };
    }

    thread_cb.entry.replace(&mut *lock, None);
    thread_cb.detached.replace(&mut *lock, false);
    thread_cb.st.replace(&mut *lock, ThreadState::Vacant);
    let generation = thread_cb.generation.get(&*lock);
    thread_cb
        .generation
        .replace(&mut *lock, generation.wrapping_add(1));
}

/// Transition the thread into the Ready state and insert it at the tail of
/// its priority's ready list.
///
/// This function doesn't do any proper cleanup for a previous state; the
/// caller is responsible for having removed the thread from any queue it was
/// on.
///
/// # Safety
///
/// `thread_cb` must not currently be on the ready queue, and its context
/// state must be initialized.
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread_cb: &'static ThreadCb<Traits>,
) {
    thread_cb.st.replace(&mut *lock, ThreadState::Ready);
    Traits::state()
        .ready_queue
        .push_back_thread(lock.borrow_mut(), thread_cb);
}

/// Relinquish CPU Lock. After that, if there's a higher-priority thread than
/// the running one, request a dispatch.
///
/// System services that transition a thread into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    // Scheduling starts at `dispatch_first_thread`; until then threads only
    // accumulate in the ready queue.
    if !timeout::is_clock_initialized(lock.borrow_mut()) {
        return;
    }

    let prev_priority = match Traits::state().running_thread(lock.borrow_mut()) {
        Some(running_thread) if running_thread.st.get(&*lock) == ThreadState::Running => {
            Some(running_thread.effective_priority.get(&*lock))
        }
        _ => None,
    };

    let has_preempting_thread = Traits::state()
        .ready_queue
        .has_ready_thread_above(lock.borrow_mut(), prev_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_thread {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements [`PortToKernel::choose_running_thread`](crate::PortToKernel).
#[inline]
pub(crate) fn choose_next_running_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // The priority of the current thread, or `None` if there is no current
    // thread anymore and a new one must be elected regardless
    let prev_running_thread = Traits::state().running_thread(lock.borrow_mut());
    let prev_priority = match prev_running_thread {
        Some(running_thread) if running_thread.st.get(&*lock) == ThreadState::Running => {
            Some(running_thread.effective_priority.get(&*lock))
        }
        _ => None,
    };

    let decision = Traits::state()
        .ready_queue
        .pop_front_thread(lock.borrow_mut(), prev_priority);

    let next_running_thread = match decision {
        ScheduleDecision::SwitchTo(thread) => thread,

        // There's no thread willing to take over the current one, and the
        // current one can still run.
        ScheduleDecision::Keep => {
            debug_assert!(prev_priority.is_some());
            return;
        }
    };

    if let Some(thread_cb) = next_running_thread {
        thread_cb.st.replace(&mut *lock, ThreadState::Running);
        timeout::reset_quantum(lock.borrow_mut());

        if ptr_from_option_ref(prev_running_thread) == thread_cb {
            // Skip the remaining steps if the decision kept the same thread
            return;
        }
    }

    // `prev_running_thread` now loses control of the processor.
    if let Some(running_thread) = prev_running_thread {
        match running_thread.st.get(&*lock) {
            ThreadState::Running => {
                // Preempted; back to the tail of its ready band.
                // Safety: the previous state is Running
                unsafe { make_ready(lock.borrow_mut(), running_thread) };
            }
            // Stays wherever the blocking or retiring service put it
            ThreadState::Waiting | ThreadState::Ready | ThreadState::Terminated => {}
            ThreadState::Vacant | ThreadState::Created => unreachable!(),
        }
    }

    Traits::state()
        .running_thread
        .replace(&mut *lock, next_running_thread);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        ptr::null()
    }
}

/// Transition the currently running thread into the Waiting state. Returns
/// when woken up.
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert_eq!(state::expect_thread_context::<Traits>(), Ok(()));

    // Transition the current thread to Waiting
    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
    debug_assert_eq!(running_thread.st.get(&*lock), ThreadState::Running);
    running_thread.st.replace(&mut *lock, ThreadState::Waiting);

    loop {
        // Temporarily release CPU Lock while the dispatch takes place.
        // Safety: (1) no CPU Lock-protected state is accessed in this window,
        //         (2) CPU Lock is currently active, and (3) it is re-acquired
        //         before the loop re-examines the thread state.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Safety: re-acquiring the lock released above
        unsafe { Traits::enter_cpu_lock() };

        if running_thread.st.get(&*lock) == ThreadState::Running {
            break;
        }

        debug_assert_eq!(running_thread.st.get(&*lock), ThreadState::Waiting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cfg, KernelCfg};

    fn noop_entry(_: usize) {}

    #[test]
    fn spawn_start_and_priorities() {
        crate::test_util::instantiate_test_kernel!(System);

        let thread = Thread::<System>::spawn(128, 6, noop_entry, 0).unwrap();
        assert_eq!(thread.state().unwrap(), ThreadState::Created);
        assert_eq!(thread.priority().unwrap(), 6);
        assert_eq!(thread.effective_priority().unwrap(), 6);

        assert_eq!(thread.start(), Ok(()));
        assert_eq!(thread.state().unwrap(), ThreadState::Ready);
        // Starting twice is an error
        assert_eq!(thread.start(), Err(Error::BadParam));

        assert_eq!(thread.set_priority(9), Ok(()));
        assert_eq!(thread.priority().unwrap(), 9);
        assert_eq!(thread.effective_priority().unwrap(), 9);
    }

    #[test]
    fn spawn_resource_errors() {
        crate::test_util::instantiate_test_kernel!(System);

        // The stack provider fails long before the address space runs out
        assert_eq!(
            Thread::<System>::spawn(usize::MAX / 2, 1, noop_entry, 0).unwrap_err(),
            Error::NoMemory
        );

        let mut spawned = Vec::new();
        for _ in 0..cfg::MAX_THREADS {
            spawned.push(Thread::<System>::spawn(64, 1, noop_entry, 0).unwrap());
        }
        assert_eq!(
            Thread::<System>::spawn(64, 1, noop_entry, 0).unwrap_err(),
            Error::WouldBlock
        );

        // Reclaiming a slot makes spawn succeed again
        let victim = spawned.pop().unwrap();
        let victim_cb = victim.cb();
        {
            let mut lock = klock::lock_cpu::<System>().unwrap();
            victim_cb.st.replace(&mut *lock, ThreadState::Terminated);
        }
        assert_eq!(victim.detach(), Ok(()));
        assert!(Thread::<System>::spawn(64, 1, noop_entry, 0).is_ok());

        // The old handle is stale now
        assert_eq!(victim.priority().unwrap_err(), Error::BadParam);
        assert_eq!(victim.state().unwrap_err(), Error::BadParam);
    }

    #[test]
    fn yield_rotates_among_equal_priorities() {
        crate::test_util::instantiate_test_kernel!(System);

        let first = Thread::<System>::spawn(64, 5, noop_entry, 0).unwrap();
        let second = Thread::<System>::spawn(64, 5, noop_entry, 0).unwrap();
        first.start().unwrap();
        second.start().unwrap();

        crate::test_util::boot_for_test::<System>();
        assert_eq!(first.state().unwrap(), ThreadState::Running);

        // A peer exists: the caller rotates to the tail
        this_thread::yield_now::<System>().unwrap();
        assert_eq!(first.state().unwrap(), ThreadState::Ready);
        assert_eq!(second.state().unwrap(), ThreadState::Running);

        this_thread::yield_now::<System>().unwrap();
        assert_eq!(first.state().unwrap(), ThreadState::Running);

        // Alone in the band: yield is a no-op
        {
            let second_cb = second.cb();
            let mut lock = klock::lock_cpu::<System>().unwrap();
            System::state()
                .ready_queue
                .remove_thread(lock.borrow_mut(), second_cb);
            second_cb.st.replace(&mut *lock, ThreadState::Created);
        }
        this_thread::yield_now::<System>().unwrap();
        assert_eq!(first.state().unwrap(), ThreadState::Running);
    }
}

/// Implements [`Thread::set_priority`].
fn set_thread_base_priority<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    thread_cb: &'static ThreadCb<Traits>,
    base_priority: Priority,
) -> Result {
    let st = thread_cb.st.get(&*lock);
    if matches!(st, ThreadState::Vacant | ThreadState::Terminated) {
        return Err(Error::BadParam);
    }

    let old_base_priority = thread_cb.base_priority.get(&*lock);
    if old_base_priority == base_priority {
        return Ok(());
    }

    // Raising the priority must not violate the ceiling precondition of any
    // priority-protect mutex the thread holds or waits for.
    if base_priority > old_base_priority {
        let waited_mutex =
            wait::with_current_wait_payload(lock.borrow_mut(), thread_cb, |payload| {
                if let Some(&WaitPayload::Mutex(mutex_cb)) = payload {
                    Some(mutex_cb)
                } else {
                    None
                }
            });
        if let Some(waited_mutex) = waited_mutex {
            if !mutex::does_held_mutex_allow_new_base_priority(
                lock.borrow_mut(),
                waited_mutex,
                base_priority,
            ) {
                return Err(Error::BadParam);
            }
        }

        if !mutex::do_held_mutexes_allow_new_base_priority(
            lock.borrow_mut(),
            thread_cb,
            base_priority,
        ) {
            return Err(Error::BadParam);
        }
    }

    thread_cb.base_priority.replace(&mut *lock, base_priority);

    // Recompute the effective priority and reposition the thread; if it is
    // blocked on a priority-inheritance mutex, the change propagates down the
    // contention chain before we return.
    mutex::update_priority_of_thread(lock.borrow_mut(), thread_cb);

    unlock_cpu_and_check_preemption(lock);
    Ok(())
}
