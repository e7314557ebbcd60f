//! Semaphores.
use core::{fmt, marker::PhantomData};

use crate::{
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, thread, timeout,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    Error, Id, KernelTraits, PortThreading, Result, UTicks,
};

pub(super) type SemaphoreId = Id;

/// *Semaphore control block* — the state data of a semaphore.
pub(crate) struct SemaphoreCb<Traits: PortThreading> {
    pub(crate) value: CpuLockCell<Traits, u32>,
    pub(crate) max_value: CpuLockCell<Traits, u32>,

    pub(crate) wait_queue: WaitQueue<Traits>,
}

// Safety: all interior mutability is `CpuLockCell`-mediated
unsafe impl<Traits: PortThreading> Sync for SemaphoreCb<Traits> {}

impl<Traits: PortThreading> Init for SemaphoreCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        value: Init::INIT,
        max_value: Init::INIT,
        wait_queue: Init::INIT,
    };
}

fn semaphore_cb<Traits: KernelTraits>(
    this: SemaphoreId,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static SemaphoreCb<Traits>> {
    let slot = this.get() - 1;
    if slot >= Traits::state().semaphore_count.get(&*lock) {
        return Err(Error::BadParam);
    }
    Ok(&Traits::state().semaphores[slot])
}

/// An owned handle to a counting semaphore.
pub struct Semaphore<Traits> {
    id: SemaphoreId,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for Semaphore<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for Semaphore<Traits> {}

impl<Traits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Create a semaphore with the given initial value and maximum value.
    /// `max_value` must be nonzero and at least `initial_value`.
    pub fn new(initial_value: u32, max_value: u32) -> Result<Self> {
        if max_value == 0 || initial_value > max_value {
            return Err(Error::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;

        let count = Traits::state().semaphore_count.get(&*lock);
        let semaphore_cb = Traits::state()
            .semaphores
            .get(count)
            .ok_or(Error::WouldBlock)?;

        semaphore_cb.value.replace(&mut *lock, initial_value);
        semaphore_cb.max_value.replace(&mut *lock, max_value);
        Traits::state().semaphore_count.replace(&mut *lock, count + 1);

        Ok(Self {
            id: Id::new(count + 1).unwrap(),
            _phantom: PhantomData,
        })
    }

    /// Acquire one unit, blocking until one is available.
    pub fn wait(self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;
        let semaphore_cb = semaphore_cb::<Traits>(self.id, lock.borrow_mut())?;

        if poll_core(semaphore_cb.value.write(&mut *lock)) {
            Ok(())
        } else {
            // The post path hands a unit directly to the woken thread, so a
            // successful wait needs no further action.
            semaphore_cb
                .wait_queue
                .wait(lock.borrow_mut(), WaitPayload::Semaphore(semaphore_cb))
        }
    }

    /// Acquire one unit, blocking no further than `deadline`.
    pub fn wait_until(self, deadline: UTicks) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;
        let semaphore_cb = semaphore_cb::<Traits>(self.id, lock.borrow_mut())?;

        if poll_core(semaphore_cb.value.write(&mut *lock)) {
            Ok(())
        } else if deadline <= timeout::now(lock.borrow_mut()) {
            Err(Error::Timeout)
        } else {
            semaphore_cb.wait_queue.wait_timeout(
                lock.borrow_mut(),
                WaitPayload::Semaphore(semaphore_cb),
                deadline,
            )
        }
    }

    /// Acquire one unit without blocking. Fails with [`Error::WouldBlock`]
    /// if none is available.
    pub fn try_wait(self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let semaphore_cb = semaphore_cb::<Traits>(self.id, lock.borrow_mut())?;

        if poll_core(semaphore_cb.value.write(&mut *lock)) {
            Ok(())
        } else {
            Err(Error::WouldBlock)
        }
    }

    /// Release one unit: hand it to the head waiter if there is one
    /// (without touching the counter), otherwise increment the counter.
    /// Fails with [`Error::Overflow`] if the counter is at `max_value`.
    pub fn post(self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let semaphore_cb = semaphore_cb::<Traits>(self.id, lock.borrow_mut())?;
        post(semaphore_cb, lock)
    }

    /// Get the current counter value.
    pub fn value(self) -> Result<u32> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let semaphore_cb = semaphore_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(semaphore_cb.value.get(&*lock))
    }
}

/// Check if `value` satisfies the wait condition; if so, update it and
/// return `true`.
#[inline]
fn poll_core(value: &mut u32) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

fn post<Traits: KernelTraits>(
    semaphore_cb: &'static SemaphoreCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result {
    if semaphore_cb.wait_queue.wake_up_one(lock.borrow_mut()) {
        // The unit went to the woken thread; it may preempt us
        thread::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    let value = semaphore_cb.value.get(&*lock);
    if value == semaphore_cb.max_value.get(&*lock) {
        return Err(Error::Overflow);
    }
    semaphore_cb.value.replace(&mut *lock, value + 1);
    Ok(())
}
