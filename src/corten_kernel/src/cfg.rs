//! Compile-time kernel capacities.
//!
//! The kernel allocates nothing at runtime; every object comes from a
//! fixed-capacity arena sized here.

/// The number of priority levels. Priorities range over
/// `0..PRIORITY_LEVELS`, `0` being the conventional idle level and
/// `PRIORITY_LEVELS - 1` the most urgent.
pub const PRIORITY_LEVELS: usize = 256;

/// The capacity of the TCB arena. [`Thread::spawn`](crate::Thread::spawn)
/// fails with [`Error::WouldBlock`](crate::Error::WouldBlock) when no vacant
/// slot remains. Slots are recycled by `join` and `detach`.
pub const MAX_THREADS: usize = 32;

/// The capacity of the mutex arena. Mutexes are never deleted.
pub const MAX_MUTEXES: usize = 64;

/// The capacity of the semaphore arena. Semaphores are never deleted.
pub const MAX_SEMAPHORES: usize = 16;

/// The round-robin quantum, in ticks. A running thread that exhausts its
/// quantum is rotated to the tail of its priority band if another thread of
/// the same effective priority is ready.
pub const QUANTUM_TICKS: u32 = 10;
