//! Priority inheritance rewind when lock attempts are canceled by timeout.
//!
//! Ten threads form a vertical chain against `main`: thread `Ti` (base
//! priority `P+i+1`) locks `M(i+1)` outright (except the last one) and then
//! attempts `Mi` — held by its predecessor — with a deadline. The deadlines
//! shrink with priority, so the most urgent thread gives up first, and every
//! expiry must lower `main`'s inherited priority by exactly one step. Every
//! timed lock must report `Timeout`.
use std::sync::Mutex as StdMutex;

use corten_kernel::{this_thread, time, Error, Mutex, MutexProtocol, MutexType, Thread};
use corten_port_std::{boot_kernel, shutdown, use_port};

use_port!(unsafe struct System);

type KThread = Thread<System>;
type KMutex = Mutex<System>;

const STACK_SIZE: usize = 32 * 1024;
const MAIN_PRIORITY: u8 = 10;
const TOTAL_THREADS: usize = 10;

/// One timeout step, in ticks. Generous enough that host scheduling jitter
/// cannot reorder the expiries.
const DURATION_UNIT: u64 = 50;

static MUTEXES: StdMutex<Vec<KMutex>> = StdMutex::new(Vec::new());

fn try_lock_thread_body(index: usize) {
    let (held, contended) = {
        let mutexes = MUTEXES.lock().unwrap();
        let held = (index + 1 < TOTAL_THREADS).then(|| mutexes[index + 1]);
        (held, mutexes[index])
    };

    if let Some(held) = held {
        held.lock().unwrap();
    }

    let deadline = time::now::<System>().unwrap()
        + DURATION_UNIT * (TOTAL_THREADS - index) as u64;
    assert_eq!(contended.try_lock_until(deadline), Err(Error::Timeout));

    if let Some(held) = held {
        held.unlock().unwrap();
    }
}

fn main_thread(_: usize) {
    let mutexes: Vec<KMutex> = (0..TOTAL_THREADS)
        .map(|_| KMutex::new(MutexType::Normal, MutexProtocol::PriorityInheritance).unwrap())
        .collect();
    *MUTEXES.lock().unwrap() = mutexes.clone();

    mutexes[0].lock().unwrap();

    let threads: Vec<KThread> = (0..TOTAL_THREADS)
        .map(|i| {
            KThread::spawn(
                STACK_SIZE,
                MAIN_PRIORITY + i as u8 + 1,
                try_lock_thread_body,
                i,
            )
            .unwrap()
        })
        .collect();

    for &thread in &threads {
        thread.start().unwrap();
        assert_eq!(
            this_thread::effective_priority::<System>().unwrap(),
            thread.effective_priority().unwrap()
        );
    }
    assert_eq!(
        this_thread::effective_priority::<System>().unwrap(),
        MAIN_PRIORITY + TOTAL_THREADS as u8
    );

    // The most urgent thread expires first; each expiry removes exactly the
    // topmost link of the chain
    for (i, &thread) in threads.iter().enumerate().rev() {
        thread.join().unwrap();
        assert_eq!(
            this_thread::effective_priority::<System>().unwrap(),
            MAIN_PRIORITY + i as u8,
            "after thread {i} expired"
        );
    }

    mutexes[0].unlock().unwrap();
    assert_eq!(
        this_thread::effective_priority::<System>().unwrap(),
        MAIN_PRIORITY
    );

    shutdown::<System>();
}

#[test]
fn priority_inheritance_timeout() {
    boot_kernel::<System>(main_thread, 0, MAIN_PRIORITY);
}
