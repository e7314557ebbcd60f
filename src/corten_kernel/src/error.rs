//! Kernel error codes.
use core::fmt;

/// The error type returned by every fallible kernel operation.
///
/// Discriminants are stable POSIX-style integers; [`Error::errno`] exposes
/// them for foreign-function or wire use. No other values are produced by the
/// kernel.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Error {
    /// `EPERM` — the caller does not own the object (e.g. unlocking a mutex
    /// it has not locked).
    NotOwner = 1,

    /// `EINTR` — a wait was interrupted by a forced wake. Reserved: no
    /// operation of this core produces it.
    Interrupted = 4,

    /// `EAGAIN` — a resource is transiently unavailable (no vacant TCB slot,
    /// `try_wait` on a depleted semaphore).
    WouldBlock = 11,

    /// `ENOMEM` — the stack provider could not satisfy an allocation.
    NoMemory = 12,

    /// `EBUSY` — `try_lock` found the mutex contended.
    Busy = 16,

    /// `EINVAL` — a parameter violates the object's constraints (bad
    /// priority, stale id, ceiling below the caller, bad semaphore bounds).
    BadParam = 22,

    /// `EDEADLK` — the operation would deadlock (relocking a non-recursive
    /// mutex, a lock whose contention chain cycles back to the caller,
    /// joining the current thread).
    Deadlock = 35,

    /// `EOVERFLOW` — a semaphore post would exceed its maximum value.
    Overflow = 75,

    /// `ETIMEDOUT` — a timed operation reached its deadline.
    Timeout = 110,
}

impl Error {
    /// The stable integer code of this error.
    #[inline]
    pub const fn errno(self) -> i16 {
        self as i16
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotOwner => "NotOwner (EPERM)",
            Self::Interrupted => "Interrupted (EINTR)",
            Self::WouldBlock => "WouldBlock (EAGAIN)",
            Self::NoMemory => "NoMemory (ENOMEM)",
            Self::Busy => "Busy (EBUSY)",
            Self::BadParam => "BadParam (EINVAL)",
            Self::Deadlock => "Deadlock (EDEADLK)",
            Self::Overflow => "Overflow (EOVERFLOW)",
            Self::Timeout => "Timeout (ETIMEDOUT)",
        };
        f.write_str(name)
    }
}

/// Result type of the kernel services.
pub type Result<T = ()> = core::result::Result<T, Error>;
