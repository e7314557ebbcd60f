//! Simulator port of the Corten kernel for hosted environments.
//!
//! The port simulates a single-core target: every kernel thread is backed by
//! an OS thread, but at most one of them executes at a time — the rest are
//! parked on a run gate until the kernel's scheduling decision elects them.
//! All context switches originate from the kernel's own dispatch requests
//! (`yield_cpu`), which is exactly the set of suspension points the kernel
//! defines, so a cooperative gate faithfully reproduces the target's
//! preemption behavior.
//!
//! CPU Lock maps to a host mutex plus an owner record; the timer interrupt is
//! a dedicated ticker thread that delivers `timer_tick` once per millisecond
//! (one tick = one millisecond of host time) and contends for CPU Lock like
//! any interrupt would.
//!
//! Use [`use_port!`] to instantiate the port for a system type, then
//! [`boot_kernel`] to run a thread inside the simulated kernel:
//!
//! ```ignore
//! corten_port_std::use_port!(unsafe struct SystemTraits);
//!
//! fn main_thread(_: usize) {
//!     // ... kernel services are available here ...
//!     corten_port_std::shutdown::<SystemTraits>();
//! }
//!
//! fn main() {
//!     corten_port_std::boot_kernel::<SystemTraits>(main_thread, 0, 10);
//! }
//! ```
use std::{
    any::Any,
    cell::Cell,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Condvar, Mutex, MutexGuard, OnceLock,
    },
    thread::{JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use corten_kernel::{KernelTraits, PortToKernel, Priority, ThreadCb, UTicks};
use spin::Mutex as SpinMutex;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate corten_kernel;

/// The host-time length of one kernel tick.
pub const TICK_PERIOD: Duration = Duration::from_millis(1);

/// The stack size [`boot_kernel`] requests for the first thread.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance: KernelTraits<PortThreadState = TaskState> {
    fn port_state() -> &'static State;
}

/// The role of a host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The thread that called [`boot_kernel`].
    Boot,
    /// The ticker thread, standing in for the timer interrupt context.
    Interrupt,
    /// The backing thread of a kernel thread.
    Task,
}

thread_local! {
    /// The current host thread's role, assigned when the port creates or
    /// adopts the thread.
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };

    /// The TCB slot a `Task`-role host thread is backing.
    static TASK_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Task state machine of the port. Doesn't exactly align with the kernel's
/// thread states: it only tracks whether a backing host thread exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// No context configured; the kernel must call `initialize_thread_state`
    /// before dispatching this thread.
    Uninit,
    /// Context configured, backing thread not started yet.
    Dormant,
    /// A backing host thread exists.
    Running,
}

/// The port-specific per-thread state embedded in each TCB.
#[derive(Debug)]
pub struct TaskState {
    /// Accessed only with CPU Lock held, so a `SpinMutex` is sufficient; the
    /// runtime performance of the simulator is not a concern.
    tsm: SpinMutex<Tsm>,
}

impl TaskState {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

/// The payload type of the panic used to unwind parked workers at shutdown.
struct ShutdownSignal;

struct PortInner {
    /// The host thread currently holding CPU Lock.
    cpu_lock_owner: Option<ThreadId>,
    /// The TCB slot of the thread the kernel elected to run.
    current_slot: Option<usize>,
    shutdown: bool,
}

enum TimerCmd {
    /// Deliver a tick as soon as possible.
    WakeNow,
    /// Deliver a tick no later than `at`.
    SetTimeout { at: Instant },
}

/// The internal state of the port. One static instance exists per system
/// type (created by [`use_port!`]).
pub struct State {
    inner: Mutex<PortInner>,
    /// Signals changes of `cpu_lock_owner`, `current_slot`, and `shutdown`.
    wakeup: Condvar,
    timer_cmd_send: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
    origin: OnceLock<Instant>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    worker_panic: Mutex<Option<Box<dyn Any + Send>>>,
    booted: AtomicBool,
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(PortInner {
                cpu_lock_owner: None,
                current_slot: None,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            timer_cmd_send: SpinMutex::new(None),
            origin: OnceLock::new(),
            worker_handles: Mutex::new(Vec::new()),
            worker_panic: Mutex::new(None),
            booted: AtomicBool::new(false),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, PortInner> {
        self.inner.lock().unwrap()
    }

    /// Whether the calling host thread may take CPU Lock right now. A
    /// backing thread may only do so while its kernel thread is the elected
    /// one — this is what makes the simulation single-core: every kernel
    /// entry of a scheduled-away thread stalls here until the thread is
    /// elected again.
    fn may_take_cpu_lock(inner: &PortInner) -> bool {
        if THREAD_ROLE.with(|role| role.get()) != ThreadRole::Task {
            return true;
        }
        match TASK_SLOT.with(|slot| slot.get()) {
            // A retiring thread is past scheduling
            None => true,
            Some(slot) => inner.current_slot == Some(slot),
        }
    }

    fn acquire_cpu_lock(&self, reentry_is_fatal: bool) -> bool {
        let me = std::thread::current().id();
        let mut inner = self.lock_inner();
        loop {
            if inner.cpu_lock_owner == Some(me) {
                if reentry_is_fatal {
                    panic!("CPU Lock reentered by the same context");
                }
                return false;
            }
            if inner.cpu_lock_owner.is_none() && Self::may_take_cpu_lock(&inner) {
                inner.cpu_lock_owner = Some(me);
                return true;
            }
            if inner.shutdown {
                // Give up during teardown; `leave_cpu_lock` is lenient once
                // shutdown has begun
                drop(inner);
                std::panic::panic_any(ShutdownSignal);
            }
            inner = self.wakeup.wait(inner).unwrap();
        }
    }

    pub unsafe fn enter_cpu_lock(&self) {
        self.acquire_cpu_lock(true);
    }

    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        self.acquire_cpu_lock(false)
    }

    pub unsafe fn leave_cpu_lock(&self) {
        let me = std::thread::current().id();
        let mut inner = self.lock_inner();
        if inner.cpu_lock_owner == Some(me) {
            inner.cpu_lock_owner = None;
            self.wakeup.notify_all();
        } else {
            assert!(
                inner.shutdown,
                "CPU Lock released by a context that does not hold it"
            );
        }
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        let me = std::thread::current().id();
        self.lock_inner().cpu_lock_owner == Some(me)
    }

    pub fn is_thread_context(&self) -> bool {
        THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task
    }

    /// Run the kernel's scheduling decision and publish the outcome to the
    /// run gate, starting a backing thread for the chosen kernel thread if it
    /// doesn't have one yet. CPU Lock serializes concurrent dispatch
    /// requests end to end, so `current_slot` never lags behind the kernel's
    /// own record of the running thread.
    fn dispatch<Traits: PortInstance>(&'static self) {
        unsafe { Traits::enter_cpu_lock() };
        let chosen = unsafe { <Traits as PortToKernel>::choose_running_thread() };

        {
            let mut inner = self.lock_inner();
            inner.current_slot = chosen.map(|thread_cb| thread_cb.slot());
            self.wakeup.notify_all();
        }

        if let Some(thread_cb) = chosen {
            self.start_backing_thread_if_needed::<Traits>(thread_cb);
        }

        unsafe { Traits::leave_cpu_lock() };
    }

    fn start_backing_thread_if_needed<Traits: PortInstance>(
        &'static self,
        thread_cb: &'static ThreadCb<Traits>,
    ) {
        let mut tsm = thread_cb.port_thread_state.tsm.lock();
        if *tsm != Tsm::Dormant {
            return;
        }
        *tsm = Tsm::Running;
        drop(tsm);

        let slot = thread_cb.slot();
        log::trace!("starting backing thread for kernel thread {slot}");
        let handle = std::thread::Builder::new()
            .name(format!("kthread-{slot}"))
            .spawn(move || worker_main::<Traits>(thread_cb, slot))
            .unwrap();
        self.worker_handles.lock().unwrap().push(handle);
    }

    /// Park the calling worker until the kernel elects its thread again.
    fn wait_until_current(&self, slot: usize) {
        let mut inner = self.lock_inner();
        loop {
            if inner.shutdown {
                drop(inner);
                std::panic::panic_any(ShutdownSignal);
            }
            if inner.current_slot == Some(slot) {
                return;
            }
            inner = self.wakeup.wait(inner).unwrap();
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        self.dispatch::<Traits>();

        if THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task {
            let slot = TASK_SLOT.with(|slot| slot.get()).unwrap();
            self.wait_until_current(slot);
        }
    }

    pub unsafe fn dispatch_first_thread<Traits: PortInstance>(&'static self) {
        log::trace!("dispatch_first_thread");
        assert_eq!(THREAD_ROLE.with(|role| role.get()), ThreadRole::Boot);

        self.dispatch::<Traits>();

        // The boot context stands in for the idle loop: it sleeps until the
        // simulated system shuts down
        let mut inner = self.lock_inner();
        while !inner.shutdown {
            inner = self.wakeup.wait(inner).unwrap();
        }
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        thread_cb: &'static ThreadCb<Traits>,
    ) {
        log::trace!("exit_and_dispatch({})", thread_cb.slot());
        assert_eq!(THREAD_ROLE.with(|role| role.get()), ThreadRole::Task);

        TASK_SLOT.with(|slot| slot.set(None));
        self.dispatch::<Traits>();
        // The backing thread runs to completion after this returns
    }

    pub unsafe fn initialize_thread_state<Traits: PortInstance>(
        &self,
        thread_cb: &'static ThreadCb<Traits>,
    ) {
        let mut tsm = thread_cb.port_thread_state.tsm.lock();
        assert_eq!(*tsm, Tsm::Uninit);
        *tsm = Tsm::Dormant;
    }

    pub unsafe fn reclaim_thread_state<Traits: PortInstance>(
        &self,
        thread_cb: &'static ThreadCb<Traits>,
    ) {
        let mut tsm = thread_cb.port_thread_state.tsm.lock();
        *tsm = Tsm::Uninit;
    }

    pub fn tick_count(&self) -> UTicks {
        let origin = self.origin.get_or_init(Instant::now);
        Instant::now().duration_since(*origin).as_millis() as UTicks
    }

    pub fn pend_tick_after(&self, delta: UTicks) {
        let at = Instant::now() + TICK_PERIOD * delta.min(u32::MAX as UTicks) as u32;
        if let Some(send) = &*self.timer_cmd_send.lock() {
            let _ = send.send(TimerCmd::SetTimeout { at });
        }
    }

    pub fn pend_tick(&self) {
        if let Some(send) = &*self.timer_cmd_send.lock() {
            let _ = send.send(TimerCmd::WakeNow);
        }
    }

    fn record_worker_panic(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.worker_panic.lock().unwrap();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    fn initiate_shutdown(&self) {
        let mut inner = self.lock_inner();
        inner.shutdown = true;
        self.wakeup.notify_all();
    }
}

fn worker_main<Traits: PortInstance>(thread_cb: &'static ThreadCb<Traits>, slot: usize) {
    THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
    TASK_SLOT.with(|cell| cell.set(Some(slot)));

    let state = Traits::port_state();
    let result = catch_unwind(AssertUnwindSafe(|| {
        state.wait_until_current(slot);
        log::debug!("kernel thread {slot} is now running");
        // Safety: the kernel dispatched this thread and we are its context
        unsafe { corten_kernel::run_thread_body::<Traits>(thread_cb) };
    }));

    if let Err(payload) = result {
        if payload.downcast_ref::<ShutdownSignal>().is_none() {
            // A genuine failure inside a kernel thread: remember it and tear
            // the simulation down so `boot_kernel` can re-raise it
            state.record_worker_panic(payload);
            state.initiate_shutdown();
        }
    }
}

/// Boot the simulated kernel with a first thread running `entry(param)` at
/// the given priority. Returns when [`shutdown`] has been called and every
/// backing thread has finished; a panic raised inside a kernel thread is
/// propagated to the caller.
pub fn boot_kernel<Traits: PortInstance>(entry: fn(usize), param: usize, priority: Priority) {
    let _ = env_logger::builder().is_test(true).try_init();

    let state = Traits::port_state();
    assert!(
        !state.booted.swap(true, Ordering::SeqCst),
        "the simulated kernel cannot be restarted within one process"
    );

    THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));

    // Start the ticker thread
    let (timer_cmd_send, timer_cmd_recv) = mpsc::channel();
    *state.timer_cmd_send.lock() = Some(timer_cmd_send);
    log::trace!("starting the ticker thread");
    let timer_join_handle = std::thread::Builder::new()
        .name("ticker".to_owned())
        .spawn(move || {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));

            let deliver_tick = || {
                // Safety: interrupt context, CPU Lock inactive
                let result = catch_unwind(AssertUnwindSafe(|| unsafe {
                    <Traits as PortToKernel>::timer_tick()
                }));
                if let Err(payload) = result {
                    // A tick racing the teardown may be abandoned mid-way;
                    // anything else is a real kernel failure
                    if payload.downcast_ref::<ShutdownSignal>().is_none() {
                        resume_unwind(payload);
                    }
                }
            };

            let mut next_deadline: Option<Instant> = None;
            loop {
                let timeout = match next_deadline {
                    Some(at) => at.saturating_duration_since(Instant::now()).min(TICK_PERIOD),
                    None => TICK_PERIOD,
                };
                match timer_cmd_recv.recv_timeout(timeout) {
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        next_deadline = None;
                        deliver_tick();
                    }
                    Ok(TimerCmd::SetTimeout { at }) => next_deadline = Some(at),
                    Ok(TimerCmd::WakeNow) => {
                        next_deadline = None;
                        deliver_tick();
                    }
                }
            }
        })
        .unwrap();

    // Create and start the first thread, then hand control to the kernel
    let thread = corten_kernel::Thread::<Traits>::spawn(DEFAULT_STACK_SIZE, priority, entry, param)
        .expect("failed to create the first thread");
    thread.start().expect("failed to start the first thread");

    // Safety: called exactly once, CPU Lock inactive
    unsafe { <Traits as PortToKernel>::boot() };

    // `boot` has returned: shutdown is in progress. Stop the ticker first so
    // no new dispatches occur while the workers unwind.
    log::trace!("stopping the ticker thread");
    *state.timer_cmd_send.lock() = None;
    timer_join_handle.join().unwrap();

    loop {
        let handle = state.worker_handles.lock().unwrap().pop();
        match handle {
            Some(handle) => {
                let _ = handle.join();
            }
            None => break,
        }
    }

    // Re-raise the first failure observed in a kernel thread
    if let Some(payload) = state.worker_panic.lock().unwrap().take() {
        resume_unwind(payload);
    }
}

/// Initiate graceful shutdown: every parked backing thread unwinds, and
/// [`boot_kernel`] returns once all of them have finished.
///
/// Usually called by the last kernel thread as its final act.
pub fn shutdown<Traits: PortInstance>() {
    Traits::port_state().initiate_shutdown();
}

/// Stack provider implementation shared by `use_port!` instantiations.
#[doc(hidden)]
pub fn allocate_stack(size: usize) -> Option<*mut u8> {
    let mut storage = Vec::<u8>::new();
    storage.try_reserve_exact(size.max(1)).ok()?;
    storage.resize(size.max(1), 0);
    Some(Box::into_raw(storage.into_boxed_slice()) as *mut u8)
}

#[doc(hidden)]
pub unsafe fn deallocate_stack(ptr: *mut u8, size: usize) {
    unsafe {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
            ptr,
            size.max(1),
        )));
    }
}

/// Instantiate the port for a system type: implements the kernel's port
/// traits and provides the kernel state singleton.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::corten_kernel::{
                KernelCfg, KernelState, PortStack, PortThreading, PortTimer, ThreadCb, UTicks,
            };
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type PortThreadState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_THREAD_STATE_INIT: Self::PortThreadState = TaskState::new();

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_thread_context() -> bool {
                    PORT_STATE.is_thread_context()
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn dispatch_first_thread() {
                    unsafe { PORT_STATE.dispatch_first_thread::<Self>() }
                }

                unsafe fn exit_and_dispatch(thread: &'static ThreadCb<Self>) {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(thread) }
                }

                unsafe fn initialize_thread_state(thread: &'static ThreadCb<Self>) {
                    unsafe { PORT_STATE.initialize_thread_state::<Self>(thread) }
                }

                unsafe fn reclaim_thread_state(thread: &'static ThreadCb<Self>) {
                    unsafe { PORT_STATE.reclaim_thread_state::<Self>(thread) }
                }
            }

            impl PortTimer for $SystemTraits {
                unsafe fn tick_count() -> UTicks {
                    PORT_STATE.tick_count()
                }

                unsafe fn pend_tick_after(delta: UTicks) {
                    PORT_STATE.pend_tick_after(delta)
                }

                unsafe fn pend_tick() {
                    PORT_STATE.pend_tick()
                }
            }

            unsafe impl PortStack for $SystemTraits {
                unsafe fn allocate_stack(size: usize) -> Option<*mut u8> {
                    $crate::allocate_stack(size)
                }

                unsafe fn deallocate_stack(ptr: *mut u8, size: usize) {
                    unsafe { $crate::deallocate_stack(ptr, size) }
                }
            }

            impl KernelCfg for $SystemTraits {
                fn state() -> &'static KernelState<Self> {
                    static KERNEL_STATE: KernelState<$SystemTraits> = KernelState::INIT;
                    &KERNEL_STATE
                }
            }
        }
    };
}
