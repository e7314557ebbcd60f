//! Priority changes propagate through a contention chain.
//!
//! Ten threads and `main` form a vertical chain through ten
//! priority-inheritance mutexes. Changing the base priority of any thread in
//! the chain — including spikes to `u8::MAX` and drops to `main`'s level —
//! must propagate "up" the chain synchronously, and lowering one member must
//! never pull the chain below another, higher member's contribution.
use std::sync::Mutex as StdMutex;

use corten_kernel::{this_thread, Mutex, MutexProtocol, MutexType, Thread};
use corten_port_std::{boot_kernel, shutdown, use_port};

use_port!(unsafe struct System);

type KThread = Thread<System>;
type KMutex = Mutex<System>;

const STACK_SIZE: usize = 32 * 1024;
const MAIN_PRIORITY: u8 = 10;
const TOTAL_THREADS: usize = 10;

static MUTEXES: StdMutex<Vec<KMutex>> = StdMutex::new(Vec::new());

fn lock_thread_body(index: usize) {
    let (first, second) = {
        let mutexes = MUTEXES.lock().unwrap();
        let first = (index + 1 < TOTAL_THREADS).then(|| mutexes[index + 1]);
        (first, mutexes[index])
    };

    if let Some(first) = first {
        first.lock().unwrap();
    }
    second.lock().unwrap();

    second.unlock().unwrap();
    if let Some(first) = first {
        first.unlock().unwrap();
    }
}

/// Walk the chain from its far end, asserting that every member's effective
/// priority is the max of its own base priority and what it inherits.
fn assert_chain_consistent(threads: &[KThread]) {
    let mut inherited_priority = 0u8;

    for thread in threads.iter().rev() {
        let expected = inherited_priority.max(thread.priority().unwrap());
        let effective = thread.effective_priority().unwrap();
        assert_eq!(effective, expected);
        inherited_priority = effective;
    }

    let expected = inherited_priority.max(this_thread::priority::<System>().unwrap());
    assert_eq!(
        this_thread::effective_priority::<System>().unwrap(),
        expected
    );
}

fn main_thread(_: usize) {
    let mutexes: Vec<KMutex> = (0..TOTAL_THREADS)
        .map(|_| KMutex::new(MutexType::Normal, MutexProtocol::PriorityInheritance).unwrap())
        .collect();
    *MUTEXES.lock().unwrap() = mutexes.clone();

    mutexes[0].lock().unwrap();

    let threads: Vec<KThread> = (0..TOTAL_THREADS)
        .map(|i| {
            KThread::spawn(STACK_SIZE, MAIN_PRIORITY + i as u8 + 1, lock_thread_body, i).unwrap()
        })
        .collect();

    for &thread in &threads {
        thread.start().unwrap();
        assert_eq!(
            this_thread::effective_priority::<System>().unwrap(),
            thread.effective_priority().unwrap()
        );
    }

    // (thread index, new base priority)
    let mut priority_changes: Vec<(usize, u8)> = Vec::new();
    // Set every thread to `main`'s level (the chain must keep the floor set
    // by the remaining, not-yet-lowered members), then restore in reverse
    for i in (0..TOTAL_THREADS).rev() {
        priority_changes.push((i, MAIN_PRIORITY));
    }
    for i in 0..TOTAL_THREADS {
        priority_changes.push((i, MAIN_PRIORITY + i as u8 + 1));
    }
    // Spike every thread to the maximum priority, restoring after each spike
    for i in 0..TOTAL_THREADS {
        priority_changes.push((i, u8::MAX));
        priority_changes.push((i, MAIN_PRIORITY + i as u8 + 1));
    }

    for &(index, priority) in &priority_changes {
        threads[index].set_priority(priority).unwrap();
        assert_chain_consistent(&threads);
    }

    mutexes[0].unlock().unwrap();

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(
        this_thread::effective_priority::<System>().unwrap(),
        MAIN_PRIORITY
    );

    shutdown::<System>();
}

#[test]
fn priority_inheritance_set_priority() {
    boot_kernel::<System>(main_thread, 0, MAIN_PRIORITY);
}
