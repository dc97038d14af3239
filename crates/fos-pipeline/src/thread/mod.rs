//! Threading Model
//!
//! One master thread drives the pipeline; a fixed set of worker threads
//! joins it for fork-join cycles.
//! - Invocation tokens carry work from any thread back to the master
//! - A rendezvous barrier opens and closes each fork-join cycle
//! - The worker pool splits index ranges into atomically claimed blocks
//! - The tick scheduler runs every module at its own cadence

mod barrier;
mod invocation;
mod pool;
mod scheduler;

pub use barrier::*;
pub use invocation::*;
pub use pool::*;
pub use scheduler::*;

#[cfg(test)]
pub(crate) use invocation::pool_sizes;

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Lock ignoring poison: panics are caught at every hand-off point, so a
/// poisoned lock still guards consistent state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
