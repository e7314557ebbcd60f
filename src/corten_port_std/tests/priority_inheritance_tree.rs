//! Basic priority inheritance through a tree of ten threads.
//!
//! `main` locks M0 and M1. Ten worker threads are connected back to `main`
//! through chains of priority-inheritance mutexes:
//!
//! ```text
//! T111 → M111 → T11 → M11 → T1 → M1 → main
//! T110 → M110 → T11
//! T101 → M101 → T10 → M10 → T1
//! T100 → M100 → T10
//! T01  → M01  → T0  → M0  → main
//! T00  → M00  → T0
//! ```
//!
//! Starting each worker (base priorities `P+1 ..= P+10`, in the order given
//! below) must raise `main`'s effective priority to that worker's, and the
//! whole tree must carry the expected per-step effective priorities. After
//! `main` releases M1 and M0 and every worker finishes, all boosts are gone.
//!
//! The scenario is run for all three mutex types.
use std::sync::Mutex as StdMutex;

use corten_kernel::{this_thread, Mutex, MutexProtocol, MutexType, Thread};
use corten_port_std::{boot_kernel, shutdown, use_port};

use_port!(unsafe struct System);

type KThread = Thread<System>;
type KMutex = Mutex<System>;

const STACK_SIZE: usize = 32 * 1024;
const MAIN_PRIORITY: u8 = 10;
const TOTAL_THREADS: usize = 10;

/// Effective priority (relative to `MAIN_PRIORITY`) of each worker after
/// each start step; row `i` applies once workers `0..=i` have been started.
#[rustfmt::skip]
const PRIORITY_BOOSTS: [[u8; TOTAL_THREADS]; TOTAL_THREADS] = [
    [1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
    [1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
    [3, 2, 3, 4, 5, 6, 7, 8, 9, 10],
    [4, 2, 3, 4, 5, 6, 7, 8, 9, 10],
    [4, 5, 3, 4, 5, 6, 7, 8, 9, 10],
    [4, 6, 3, 4, 5, 6, 7, 8, 9, 10],
    [4, 7, 3, 4, 7, 6, 7, 8, 9, 10],
    [4, 8, 3, 4, 8, 6, 7, 8, 9, 10],
    [4, 9, 3, 4, 8, 9, 7, 8, 9, 10],
    [4, 10, 3, 4, 8, 10, 7, 8, 9, 10],
];

/// Mutex indices each worker locks, in order (and unlocks, in the same
/// order). Indices: 0=M0 1=M1 2=M00 3=M01 4=M10 5=M11 6=M100 7=M101 8=M110
/// 9=M111.
const LOCK_SEQUENCES: [&[usize]; TOTAL_THREADS] = [
    &[2, 3, 0],    // T0:   M00, M01, M0
    &[4, 5, 1],    // T1:   M10, M11, M1
    &[2],          // T00:  M00
    &[3],          // T01:  M01
    &[6, 7, 4],    // T10:  M100, M101, M10
    &[8, 9, 5],    // T11:  M110, M111, M11
    &[6],          // T100: M100
    &[7],          // T101: M101
    &[8],          // T110: M110
    &[9],          // T111: M111
];

static MUTEXES: StdMutex<Vec<KMutex>> = StdMutex::new(Vec::new());

fn lock_thread_body(index: usize) {
    let sequence: Vec<KMutex> = {
        let mutexes = MUTEXES.lock().unwrap();
        LOCK_SEQUENCES[index].iter().map(|&m| mutexes[m]).collect()
    };

    for mutex in &sequence {
        mutex.lock().unwrap();
    }
    for mutex in &sequence {
        mutex.unlock().unwrap();
    }
}

fn run_round(kind: MutexType) {
    let mutexes: Vec<KMutex> = (0..TOTAL_THREADS)
        .map(|_| KMutex::new(kind, MutexProtocol::PriorityInheritance).unwrap())
        .collect();
    *MUTEXES.lock().unwrap() = mutexes.clone();

    mutexes[0].lock().unwrap();
    mutexes[1].lock().unwrap();

    let threads: Vec<KThread> = (0..TOTAL_THREADS)
        .map(|i| {
            KThread::spawn(
                STACK_SIZE,
                MAIN_PRIORITY + PRIORITY_BOOSTS[0][i],
                lock_thread_body,
                i,
            )
            .unwrap()
        })
        .collect();

    for (step, &thread) in threads.iter().enumerate() {
        thread.start().unwrap();

        // The worker has blocked into the tree; `main` inherited its priority
        assert_eq!(
            this_thread::effective_priority::<System>().unwrap(),
            thread.effective_priority().unwrap(),
            "step {step}"
        );

        for (j, &other) in threads.iter().enumerate() {
            assert_eq!(
                other.effective_priority().unwrap(),
                MAIN_PRIORITY + PRIORITY_BOOSTS[step][j],
                "step {step}, thread {j}"
            );
        }
    }

    // Dropping M1 sheds the T1 side; what remains is T0's chain
    mutexes[1].unlock().unwrap();
    assert_eq!(
        this_thread::effective_priority::<System>().unwrap(),
        threads[0].effective_priority().unwrap()
    );

    mutexes[0].unlock().unwrap();

    // Every worker outranks `main`, so they have all finished by now and
    // every boost has unwound
    assert_eq!(
        this_thread::effective_priority::<System>().unwrap(),
        MAIN_PRIORITY
    );
    for (i, &thread) in threads.iter().enumerate() {
        assert_eq!(
            thread.effective_priority().unwrap(),
            MAIN_PRIORITY + PRIORITY_BOOSTS[0][i]
        );
    }

    for thread in threads {
        thread.join().unwrap();
    }
}

fn main_thread(_: usize) {
    for kind in [
        MutexType::Normal,
        MutexType::ErrorChecking,
        MutexType::Recursive,
    ] {
        run_round(kind);
    }

    shutdown::<System>();
}

#[test]
fn priority_inheritance_tree() {
    boot_kernel::<System>(main_thread, 0, MAIN_PRIORITY);
}
