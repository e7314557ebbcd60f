//! The Corten kernel core: a fixed-priority preemptive scheduler with
//! round-robin time slicing, blocking synchronization primitives whose wait
//! discipline is integrated with the scheduler, and mutexes supporting the
//! priority-inheritance and priority-protect (immediate ceiling) locking
//! protocols.
//!
//! # Structure
//!
//! The kernel is strictly single-core. Every piece of scheduler state lives in
//! a [`KernelState`] singleton and is wrapped in a [CPU Lock cell], which
//! makes it a compile-time error to touch scheduler structures without
//! holding the CPU Lock (the interrupt-masking critical section).
//!
//! [CPU Lock cell]: crate::klock
//!
//! The hardware-facing surface is split into a few traits implemented by a
//! *port*:
//!
//!  - [`PortThreading`] — CPU Lock, dispatching, and per-thread context
//!    management.
//!  - [`PortTimer`] — the monotonic tick clock and tick interrupt
//!    programming.
//!  - [`PortStack`] — the memory provider for per-thread stacks.
//!
//! The port drives the kernel back through [`PortToKernel`].
//!
//! # Threads and objects
//!
//! Threads, mutexes, and semaphores are allocated from fixed-capacity arenas
//! inside [`KernelState`] (see [`cfg`] for the capacities), so the kernel
//! performs no dynamic allocation and every cross-object reference is a
//! stable index into an arena. Public handles ([`Thread`], [`Mutex`],
//! [`Semaphore`]) are small copyable ids.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::num::NonZeroUsize;

pub mod cfg;
mod error;
mod klock;
mod mutex;
mod semaphore;
mod state;
mod thread;
mod timeout;
mod utils;
mod wait;

#[cfg(test)]
mod test_util;

pub use crate::{
    error::{Error, Result},
    mutex::{Mutex, MutexProtocol, MutexType},
    semaphore::Semaphore,
    thread::{this_thread, run_thread_body, Thread, ThreadCb, ThreadState},
    timeout::time,
    utils::Init,
};

/// Priority value. Numerically higher values are more urgent; priority `0` is
/// the conventional idle level.
pub type Priority = u8;

/// Unsigned integer type representing the monotonic tick count. Wide enough
/// that wrap-around does not occur during the system lifetime.
pub type UTicks = u64;

/// The object ID type. The all-zero pattern is reserved so that
/// `Option<Id>`-shaped fields cost nothing.
pub type Id = NonZeroUsize;

/// Provides access to the CPU Lock, dispatching, and per-thread context state.
///
/// # Safety
///
/// The implementation must uphold the documented contract of every method;
/// the kernel relies on it for memory safety of all [`klock`]-protected state.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Port-specific per-thread state, embedded in each [`ThreadCb`].
    type PortThreadState: Send + Sync + 'static;

    /// The initial value of [`Self::PortThreadState`] for a vacant TCB slot.
    const PORT_THREAD_STATE_INIT: Self::PortThreadState;

    /// Enable CPU Lock, masking the tick interrupt and any other interrupt
    /// that can enter the kernel. Serializes with [`PortToKernel::timer_tick`].
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn enter_cpu_lock();

    /// Try to enable CPU Lock. Returns `false` if the current context already
    /// holds it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Disable CPU Lock.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active, and it must have been activated by the kernel.
    unsafe fn leave_cpu_lock();

    /// Check if CPU Lock is active in the current context.
    fn is_cpu_lock_active() -> bool;

    /// Check if the current context is a thread (as opposed to boot code or
    /// an interrupt handler).
    fn is_thread_context() -> bool;

    /// Request a dispatch: the port must (now or at the next opportunity)
    /// call [`PortToKernel::choose_running_thread`] under CPU Lock and
    /// transfer control to the chosen thread.
    ///
    /// # Safety
    ///
    /// CPU Lock must be inactive.
    unsafe fn yield_cpu();

    /// Start scheduling by performing the first dispatch. On ports with a
    /// shutdown facility this returns once the system has shut down; on
    /// bare-metal ports it never returns.
    ///
    /// # Safety
    ///
    /// Only meant to be called once, by [`PortToKernel::boot`].
    unsafe fn dispatch_first_thread();

    /// Called by an exiting thread after the kernel has retired it. The port
    /// must dispatch the next thread and dispose of the calling context.
    ///
    /// # Safety
    ///
    /// Must be called from the context of `thread`, which the kernel has
    /// already removed from scheduling. CPU Lock must be inactive.
    unsafe fn exit_and_dispatch(thread: &'static ThreadCb<Self>);

    /// Prepare the port-specific context of a thread that is about to become
    /// schedulable for the first time (or again, after a previous
    /// [`Self::reclaim_thread_state`]).
    ///
    /// # Safety
    ///
    /// CPU Lock must be active. `thread` must not be schedulable yet.
    unsafe fn initialize_thread_state(thread: &'static ThreadCb<Self>);

    /// Release any port-specific context of a terminated thread so that the
    /// TCB slot can be reused.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active. `thread` must be retired from scheduling.
    unsafe fn reclaim_thread_state(thread: &'static ThreadCb<Self>);
}

/// Provides access to the monotonic tick clock.
pub trait PortTimer {
    /// Read the current tick count. Monotonic; must not wrap during the
    /// system lifetime.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn tick_count() -> UTicks;

    /// Ask the port to call [`PortToKernel::timer_tick`] after roughly
    /// `delta` ticks (earlier is allowed, later is not by more than the tick
    /// period). The kernel calls this to shorten the time to the next
    /// deadline; the port keeps its own periodic tick regardless.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn pend_tick_after(delta: UTicks);

    /// Ask the port to call [`PortToKernel::timer_tick`] as soon as possible.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn pend_tick();
}

/// The memory provider for per-thread stacks.
///
/// # Safety
///
/// A successful [`allocate_stack`](Self::allocate_stack) must return a region
/// that is valid, unaliased, and owned by the caller until the matching
/// [`deallocate_stack`](Self::deallocate_stack).
pub unsafe trait PortStack {
    /// Allocate a stack of at least `size` bytes. Returns `None` when the
    /// provider is exhausted; the kernel surfaces this as [`Error::NoMemory`].
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn allocate_stack(size: usize) -> Option<*mut u8>;

    /// Release a stack previously returned by
    /// [`allocate_stack`](Self::allocate_stack) with the same `size`.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from `allocate_stack(size)` and must not be in
    /// use by any thread.
    unsafe fn deallocate_stack(ptr: *mut u8, size: usize);
}

/// The complete port surface.
pub trait Port: PortThreading + PortTimer + PortStack {}
impl<T: PortThreading + PortTimer + PortStack> Port for T {}

/// Associates a system type with its [`KernelState`] singleton. Implemented
/// by the port instantiation macro (e.g. `corten_port_std::use_port!`).
pub trait KernelCfg: Port {
    /// The kernel state singleton of this system.
    fn state() -> &'static KernelState<Self>;
}

/// The bound used by every kernel service.
pub trait KernelTraits: Port + KernelCfg {}
impl<T: Port + KernelCfg> KernelTraits for T {}

/// Callbacks from the port into the kernel.
///
/// # Safety
///
/// Only meant to be called by the port, under the documented conditions.
pub unsafe trait PortToKernel {
    /// Boot the kernel: record the clock origin and perform the first
    /// dispatch. Returns only if the port's
    /// [`dispatch_first_thread`](PortThreading::dispatch_first_thread) does.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, with CPU Lock inactive, before any other
    /// kernel entry.
    unsafe fn boot();

    /// Make a scheduling decision and update the running thread. Returns the
    /// thread the port must run next, or `None` if the port should idle until
    /// the next interrupt.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active.
    unsafe fn choose_running_thread() -> Option<&'static ThreadCb<Self>>
    where
        Self: PortThreading;

    /// The tick interrupt handler: advances timed waits, performs round-robin
    /// accounting, and requests a dispatch if a preemption is warranted.
    ///
    /// # Safety
    ///
    /// CPU Lock must be inactive. Must be serialized with every other kernel
    /// entry (this is what [`PortThreading::enter_cpu_lock`] provides).
    unsafe fn timer_tick();
}

unsafe impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        timeout::init_clock(lock.borrow_mut());
        drop(lock);

        // Safety: we are `boot`, giving us the right to call this
        unsafe { Traits::dispatch_first_thread() };
    }

    unsafe fn choose_running_thread() -> Option<&'static ThreadCb<Self>> {
        // Safety: the caller holds CPU Lock and relinquishes it only after we
        // return, so no `CpuLockGuard` can exist concurrently
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        thread::choose_next_running_thread(lock.borrow_mut());
        let chosen = Traits::state().running_thread.get(&*lock);
        // The lock is owned by the caller; don't release it on drop
        core::mem::forget(lock);
        chosen
    }

    unsafe fn timer_tick() {
        // Tolerate ticks arriving before `boot` has run
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            return;
        };
        if !timeout::is_clock_initialized(lock.borrow_mut()) {
            return;
        }
        timeout::handle_tick(lock);
    }
}

/// The state data of a kernel instance: the TCB, mutex, and semaphore arenas
/// plus the scheduler structures. One static instance exists per system type
/// (provided through [`KernelCfg::state`]).
pub struct KernelState<Traits: PortThreading> {
    pub(crate) threads: [ThreadCb<Traits>; cfg::MAX_THREADS],
    pub(crate) mutexes: [mutex::MutexCb<Traits>; cfg::MAX_MUTEXES],
    pub(crate) semaphores: [semaphore::SemaphoreCb<Traits>; cfg::MAX_SEMAPHORES],

    /// The number of mutex slots allocated so far. Sync objects are never
    /// deleted, so this only grows.
    pub(crate) mutex_count: klock::CpuLockCell<Traits, usize>,
    pub(crate) semaphore_count: klock::CpuLockCell<Traits, usize>,

    /// The currently running thread. `None` while the system idles.
    pub(crate) running_thread: klock::CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    pub(crate) ready_queue: thread::readyqueue::BitmapReadyQueue<Traits>,

    pub(crate) timeout: timeout::TimeoutGlobals<Traits>,
}

// Safety: every interior-mutable field is a `CpuLockCell`, whose contents are
// only reachable through the singleton CPU Lock token, or a `WaitQueue`/list
// head with the same property. The port guarantees mutual exclusion between
// all contexts that can mint that token.
unsafe impl<Traits: PortThreading> Sync for KernelState<Traits> {}

impl<Traits: PortThreading> KernelState<Traits> {
    /// The initial (boot-time) kernel state.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Self = Self {
        threads: Init::INIT,
        mutexes: Init::INIT,
        semaphores: Init::INIT,
        mutex_count: Init::INIT,
        semaphore_count: Init::INIT,
        running_thread: Init::INIT,
        ready_queue: Init::INIT,
        timeout: Init::INIT,
    };
}

impl<Traits: KernelTraits> KernelState<Traits> {
    /// Get the running thread.
    #[inline]
    pub(crate) fn running_thread(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        self.running_thread.get(&*lock)
    }
}
