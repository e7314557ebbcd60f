//! Thread lifecycle: spawn/start/join/detach, resource errors, yielding
//! among equal priorities, and relative sleeps.
use std::sync::atomic::{AtomicUsize, Ordering};

use corten_kernel::{cfg, this_thread, time, Error, Thread, ThreadState};
use corten_port_std::{boot_kernel, shutdown, use_port};

use_port!(unsafe struct System);

type KThread = Thread<System>;

const STACK_SIZE: usize = 32 * 1024;
const MAIN_PRIORITY: u8 = 10;
const PINGPONG_PRIORITY: u8 = 5;
const ROUNDS: usize = 3;

static COUNTER: AtomicUsize = AtomicUsize::new(0);
static SEQUENCE: [AtomicUsize; 2 * ROUNDS] = [const { AtomicUsize::new(usize::MAX) }; 2 * ROUNDS];

fn increment_body(amount: usize) {
    COUNTER.fetch_add(amount, Ordering::SeqCst);
}

/// Records its identity, then yields to its equal-priority peer.
fn pingpong_body(identity: usize) {
    for _ in 0..ROUNDS {
        let slot = COUNTER.fetch_add(1, Ordering::SeqCst);
        SEQUENCE[slot].store(identity, Ordering::SeqCst);
        this_thread::yield_now::<System>().unwrap();
    }
}

fn main_thread(_: usize) {
    // Plain spawn/start/join, with the entry argument delivered
    let worker = KThread::spawn(STACK_SIZE, MAIN_PRIORITY + 1, increment_body, 7).unwrap();
    assert_eq!(worker.state().unwrap(), ThreadState::Created);
    worker.start().unwrap();
    // The higher-priority worker has already run to completion
    assert_eq!(COUNTER.load(Ordering::SeqCst), 7);
    assert_eq!(worker.state().unwrap(), ThreadState::Terminated);
    worker.join().unwrap();

    // The handle went stale with the join
    assert_eq!(worker.join(), Err(Error::BadParam));
    assert_eq!(worker.priority(), Err(Error::BadParam));

    // Self-join deadlocks are reported
    let me = this_thread::current::<System>().unwrap();
    assert_eq!(me.join(), Err(Error::Deadlock));

    // Detached threads clean up after themselves
    let detached = KThread::spawn(STACK_SIZE, MAIN_PRIORITY - 1, increment_body, 1).unwrap();
    detached.detach().unwrap();
    detached.start().unwrap();
    this_thread::sleep_for::<System>(20).unwrap();
    assert_eq!(COUNTER.load(Ordering::SeqCst), 8);
    assert_eq!(detached.state(), Err(Error::BadParam));

    // Resource errors: stack provider exhaustion and TCB arena exhaustion
    assert_eq!(
        KThread::spawn(usize::MAX / 2, 1, increment_body, 0).unwrap_err(),
        Error::NoMemory
    );
    let mut hoard = Vec::new();
    loop {
        match KThread::spawn(STACK_SIZE, 1, increment_body, 0) {
            Ok(thread) => hoard.push(thread),
            Err(error) => {
                assert_eq!(error, Error::WouldBlock);
                break;
            }
        }
    }
    assert_eq!(hoard.len(), cfg::MAX_THREADS - 1);
    // Run the hoard down and reclaim every slot
    for thread in hoard {
        thread.start().unwrap();
        thread.join().unwrap();
    }

    // Round-robin fairness: two equal-priority threads alternate on yield
    COUNTER.store(0, Ordering::SeqCst);
    let first = KThread::spawn(STACK_SIZE, PINGPONG_PRIORITY, pingpong_body, 0).unwrap();
    let second = KThread::spawn(STACK_SIZE, PINGPONG_PRIORITY, pingpong_body, 1).unwrap();
    first.start().unwrap();
    second.start().unwrap();
    first.join().unwrap();
    second.join().unwrap();
    for (slot, chunk) in SEQUENCE.chunks(2).enumerate() {
        assert_eq!(chunk[0].load(Ordering::SeqCst), 0, "round {slot}");
        assert_eq!(chunk[1].load(Ordering::SeqCst), 1, "round {slot}");
    }

    // A relative sleep takes at least its duration
    let before = time::now::<System>().unwrap();
    this_thread::sleep_for::<System>(50).unwrap();
    assert!(time::now::<System>().unwrap() >= before + 50);

    shutdown::<System>();
}

#[test]
fn thread_lifecycle() {
    boot_kernel::<System>(main_thread, 0, MAIN_PRIORITY);
}
