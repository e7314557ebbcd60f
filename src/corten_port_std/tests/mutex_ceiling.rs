//! Priority-protect (immediate ceiling) mutexes.
//!
//! Locking a mutex whose ceiling is below the caller's effective priority is
//! refused. While the mutex is held the owner runs at the ceiling regardless
//! of other activity — a textbook case where the ceiling keeps a
//! medium-priority thread from starving the critical section — and on
//! release the boost disappears.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use corten_kernel::{this_thread, Error, Mutex, MutexProtocol, MutexType, Thread, ThreadState};
use corten_port_std::{boot_kernel, shutdown, use_port};

use_port!(unsafe struct System);

type KMutex = Mutex<System>;

const STACK_SIZE: usize = 32 * 1024;
const MAIN_PRIORITY: u8 = 10;
const MIDDLE_PRIORITY: u8 = 12;
const CEILING: u8 = 15;

static SEQ: AtomicUsize = AtomicUsize::new(0);
static CONTENDED: StdMutex<Option<KMutex>> = StdMutex::new(None);

fn middle_body(_: usize) {
    // Runs only once `main` has dropped back below `MIDDLE_PRIORITY`
    assert_eq!(SEQ.swap(2, Ordering::SeqCst), 1);
}

fn contender_body(_: usize) {
    let mutex = CONTENDED.lock().unwrap().unwrap();
    // The ceiling also binds threads that merely attempt the lock
    assert_eq!(mutex.lock(), Err(Error::BadParam));
}

fn main_thread(_: usize) {
    // A ceiling below the caller is rejected outright
    let too_low =
        KMutex::new(MutexType::Normal, MutexProtocol::PriorityProtect(MAIN_PRIORITY - 1)).unwrap();
    assert_eq!(too_low.lock(), Err(Error::BadParam));

    let mutex =
        KMutex::new(MutexType::Normal, MutexProtocol::PriorityProtect(CEILING)).unwrap();
    assert_eq!(this_thread::effective_priority::<System>().unwrap(), MAIN_PRIORITY);

    mutex.lock().unwrap();
    assert_eq!(this_thread::effective_priority::<System>().unwrap(), CEILING);
    assert_eq!(this_thread::priority::<System>().unwrap(), MAIN_PRIORITY);

    // While the ceiling is in force, a thread above the base priority but
    // below the ceiling cannot preempt the critical section
    SEQ.store(1, Ordering::SeqCst);
    let middle = Thread::<System>::spawn(STACK_SIZE, MIDDLE_PRIORITY, middle_body, 0).unwrap();
    middle.start().unwrap();
    assert_eq!(middle.state().unwrap(), ThreadState::Ready);
    assert_eq!(SEQ.load(Ordering::SeqCst), 1);

    // Raising the base priority past the ceiling of a held mutex is refused
    assert_eq!(
        this_thread::current::<System>().unwrap().set_priority(CEILING + 1),
        Err(Error::BadParam)
    );

    // A thread whose effective priority exceeds the ceiling cannot take the
    // mutex at all
    *CONTENDED.lock().unwrap() = Some(mutex);
    let contender =
        Thread::<System>::spawn(STACK_SIZE, CEILING + 1, contender_body, 0).unwrap();
    contender.start().unwrap();
    contender.join().unwrap();

    // Releasing the mutex drops the boost, letting the middle thread run
    mutex.unlock().unwrap();
    assert_eq!(this_thread::effective_priority::<System>().unwrap(), MAIN_PRIORITY);
    assert_eq!(SEQ.load(Ordering::SeqCst), 2);
    middle.join().unwrap();

    shutdown::<System>();
}

#[test]
fn mutex_ceiling() {
    boot_kernel::<System>(main_thread, 0, MAIN_PRIORITY);
}
