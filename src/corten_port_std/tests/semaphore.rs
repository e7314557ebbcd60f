//! Counting semaphore behavior: hand-off order, timeouts, overflow, and the
//! conservation law.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use corten_kernel::{time, Error, Semaphore, Thread};
use corten_port_std::{boot_kernel, shutdown, use_port};

use_port!(unsafe struct System);

type KSemaphore = Semaphore<System>;
type KThread = Thread<System>;

const STACK_SIZE: usize = 32 * 1024;
const MAIN_PRIORITY: u8 = 10;

static SEM: StdMutex<Option<KSemaphore>> = StdMutex::new(None);
static WAKE_COUNTER: AtomicUsize = AtomicUsize::new(0);
static WAKE_ORDER: [AtomicUsize; 4] = [const { AtomicUsize::new(usize::MAX) }; 4];

fn waiter_body(index: usize) {
    let sem = SEM.lock().unwrap().unwrap();
    sem.wait().unwrap();
    WAKE_ORDER[index].store(WAKE_COUNTER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
}

fn spawn_waiter(index: usize, priority: u8) -> KThread {
    let thread = KThread::spawn(STACK_SIZE, priority, waiter_body, index).unwrap();
    thread.start().unwrap();
    thread
}

fn main_thread(_: usize) {
    // Construction bounds
    assert_eq!(KSemaphore::new(1, 0).unwrap_err(), Error::BadParam);
    assert_eq!(KSemaphore::new(5, 4).unwrap_err(), Error::BadParam);

    // Non-blocking paths and overflow
    let sem = KSemaphore::new(1, 2).unwrap();
    assert_eq!(sem.value().unwrap(), 1);
    assert_eq!(sem.try_wait(), Ok(()));
    assert_eq!(sem.try_wait(), Err(Error::WouldBlock));
    sem.post().unwrap();
    sem.post().unwrap();
    assert_eq!(sem.value().unwrap(), 2);
    assert_eq!(sem.post(), Err(Error::Overflow));

    // A timed wait on a depleted semaphore expires
    let empty = KSemaphore::new(0, 1).unwrap();
    let deadline = time::now::<System>().unwrap() + 50;
    assert_eq!(empty.wait_until(deadline), Err(Error::Timeout));
    assert!(time::now::<System>().unwrap() >= deadline);

    // Hand-off order: highest effective priority first, FIFO among equals.
    // Waiters 0..=3 block in the order given; priorities make the expected
    // wake order [2, 1, 3, 0].
    let handoff = KSemaphore::new(0, 4).unwrap();
    *SEM.lock().unwrap() = Some(handoff);
    let waiters = [
        spawn_waiter(0, MAIN_PRIORITY + 1),
        spawn_waiter(1, MAIN_PRIORITY + 2),
        spawn_waiter(2, MAIN_PRIORITY + 3),
        spawn_waiter(3, MAIN_PRIORITY + 2),
    ];

    let initial_value = handoff.value().unwrap();
    assert_eq!(initial_value, 0);
    for _ in 0..waiters.len() {
        // Each unit goes straight to a waiter, never through the counter
        handoff.post().unwrap();
        assert_eq!(handoff.value().unwrap(), 0);
    }
    for thread in waiters {
        thread.join().unwrap();
    }
    let expected_order: [usize; 4] = [3, 1, 0, 2];
    for (index, expected) in expected_order.into_iter().enumerate() {
        assert_eq!(
            WAKE_ORDER[index].load(Ordering::SeqCst),
            expected,
            "waiter {index}"
        );
    }

    // Conservation: posts == completed waits + final − initial
    let counted = KSemaphore::new(3, 10).unwrap();
    let mut posts = 0;
    let mut waits = 0;
    for _ in 0..4 {
        counted.post().unwrap();
        posts += 1;
    }
    while counted.try_wait().is_ok() {
        waits += 1;
    }
    let final_value = counted.value().unwrap();
    assert_eq!(posts, waits + final_value as usize - 3);

    shutdown::<System>();
}

#[test]
fn semaphore() {
    boot_kernel::<System>(main_thread, 0, MAIN_PRIORITY);
}
