//! Execution-context expectations.
use crate::{Error, PortThreading, Result};

/// If the current context is not a thread context (e.g. boot code or an
/// interrupt handler), return `Err(BadParam)`. Blocking and thread-relative
/// services are only available from threads.
#[inline]
pub(super) fn expect_thread_context<Traits: PortThreading>() -> Result {
    if !Traits::is_thread_context() {
        Err(Error::BadParam)
    } else {
        Ok(())
    }
}
