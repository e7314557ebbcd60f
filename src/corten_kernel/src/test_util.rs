//! A mock port for unit-testing kernel logic in-process.
//!
//! The mock performs no real context switching: `yield_cpu` runs the
//! scheduling decision inline and returns, leaving the test in control of
//! whichever thread the kernel now considers Running. Tests drive
//! non-blocking kernel paths and inspect the resulting state; full blocking
//! behavior is covered by the hosted port's test suite.

/// Define a system type backed by the mock port, with its own kernel state
/// and clock.
macro_rules! instantiate_test_kernel {
    ($name:ident) => {
        pub struct $name;

        impl $name {
            fn cpu_lock_flag() -> &'static std::sync::atomic::AtomicBool {
                static FLAG: std::sync::atomic::AtomicBool =
                    std::sync::atomic::AtomicBool::new(false);
                &FLAG
            }

            fn clock() -> &'static std::sync::atomic::AtomicU64 {
                static CLOCK: std::sync::atomic::AtomicU64 =
                    std::sync::atomic::AtomicU64::new(0);
                &CLOCK
            }

            /// Advance the mock tick clock.
            #[allow(dead_code)]
            pub fn set_time(ticks: $crate::UTicks) {
                Self::clock().store(ticks, std::sync::atomic::Ordering::SeqCst);
            }
        }

        unsafe impl $crate::PortThreading for $name {
            type PortThreadState = ();
            const PORT_THREAD_STATE_INIT: Self::PortThreadState = ();

            unsafe fn enter_cpu_lock() {
                assert!(!Self::cpu_lock_flag().swap(true, std::sync::atomic::Ordering::SeqCst));
            }

            unsafe fn try_enter_cpu_lock() -> bool {
                !Self::cpu_lock_flag().swap(true, std::sync::atomic::Ordering::SeqCst)
            }

            unsafe fn leave_cpu_lock() {
                assert!(Self::cpu_lock_flag().swap(false, std::sync::atomic::Ordering::SeqCst));
            }

            fn is_cpu_lock_active() -> bool {
                Self::cpu_lock_flag().load(std::sync::atomic::Ordering::SeqCst)
            }

            fn is_thread_context() -> bool {
                true
            }

            unsafe fn yield_cpu() {
                // Run the scheduling decision inline; the test keeps
                // executing as whatever thread is now Running
                unsafe {
                    Self::enter_cpu_lock();
                    let _ = <Self as $crate::PortToKernel>::choose_running_thread();
                    Self::leave_cpu_lock();
                }
            }

            unsafe fn dispatch_first_thread() {
                unsafe { Self::yield_cpu() }
            }

            unsafe fn exit_and_dispatch(_thread: &'static $crate::ThreadCb<Self>) {
                panic!("exit_and_dispatch is not supported by the mock port");
            }

            unsafe fn initialize_thread_state(_thread: &'static $crate::ThreadCb<Self>) {}

            unsafe fn reclaim_thread_state(_thread: &'static $crate::ThreadCb<Self>) {}
        }

        impl $crate::PortTimer for $name {
            unsafe fn tick_count() -> $crate::UTicks {
                Self::clock().load(std::sync::atomic::Ordering::SeqCst)
            }

            unsafe fn pend_tick_after(_delta: $crate::UTicks) {}

            unsafe fn pend_tick() {}
        }

        unsafe impl $crate::PortStack for $name {
            unsafe fn allocate_stack(size: usize) -> Option<*mut u8> {
                let mut storage = Vec::<u8>::new();
                storage.try_reserve_exact(size.max(1)).ok()?;
                storage.resize(size.max(1), 0);
                Some(Box::into_raw(storage.into_boxed_slice()) as *mut u8)
            }

            unsafe fn deallocate_stack(ptr: *mut u8, size: usize) {
                unsafe {
                    drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                        ptr,
                        size.max(1),
                    )));
                }
            }
        }

        impl $crate::KernelCfg for $name {
            fn state() -> &'static $crate::KernelState<Self> {
                static KERNEL_STATE: $crate::KernelState<$name> = $crate::KernelState::INIT;
                &KERNEL_STATE
            }
        }
    };
}

pub(crate) use instantiate_test_kernel;

/// Mark the system booted (so preemption checks run) without starting real
/// dispatching.
pub(crate) fn boot_for_test<Traits: crate::KernelTraits>() {
    let mut lock = crate::klock::lock_cpu::<Traits>().unwrap();
    crate::timeout::init_clock(lock.borrow_mut());
    drop(lock);
    // Elect the first running thread, if any has been started
    unsafe { Traits::yield_cpu() };
}
