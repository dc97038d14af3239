//! State Mutation Barrier
//!
//! Lets worker code mutate shared state under a permit while the master can
//! occasionally freeze all mutation, e.g. to snapshot that state.
//!
//! A freeze taken on the master of a running engine keeps serving master
//! invocations while it waits for permits to drain, so a permit holder that
//! calls [`Engine::invoke_on_master`] can not deadlock it.

use std::fmt;
use std::sync::Arc;

use crate::engine::Engine;
use crate::thread::Monitor;

#[derive(Debug, Default)]
struct MutationState {
    active_permits: usize,
    frozen: bool,
}

/// Permit/freeze guard around sensitive state
#[derive(Clone, Default)]
pub struct StateMutationBarrier {
    monitor: Arc<Monitor<MutationState>>,
}

impl fmt::Debug for StateMutationBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.monitor.lock();
        f.debug_struct("StateMutationBarrier")
            .field("active_permits", &state.active_permits)
            .field("frozen", &state.frozen)
            .finish()
    }
}

impl StateMutationBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block while frozen, then take a permit.
    pub fn acquire_permit(&self) -> MutationPermit<'_> {
        let mut state = self.monitor.lock();
        while state.frozen {
            state = self.monitor.wait(state);
        }
        state.active_permits += 1;
        MutationPermit { barrier: self }
    }

    /// Stop new permits and wait until the active ones are released.
    ///
    /// # Panics
    ///
    /// Panics if mutations are already frozen.
    pub fn freeze_mutations(&self, engine: &Engine) -> MutationFreeze<'_> {
        let mut state = self.monitor.lock();
        assert!(!state.frozen, "state mutations are already frozen");
        state.frozen = true;

        let barrier = engine
            .active_barrier()
            .filter(|barrier| barrier.is_master_thread());
        let state = match barrier {
            Some(barrier) => {
                barrier.master_wait_on_external(&self.monitor, state, |s| s.active_permits == 0)
            }
            None => {
                while state.active_permits > 0 {
                    state = self.monitor.wait(state);
                }
                state
            }
        };
        drop(state);

        MutationFreeze { barrier: self }
    }

    pub fn is_frozen(&self) -> bool {
        self.monitor.lock().frozen
    }

    pub fn active_permits(&self) -> usize {
        self.monitor.lock().active_permits
    }
}

/// Held while mutating; released on drop
#[must_use = "the permit is released as soon as it is dropped"]
pub struct MutationPermit<'a> {
    barrier: &'a StateMutationBarrier,
}

impl Drop for MutationPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.monitor.lock();
        state.active_permits -= 1;
        if state.active_permits == 0 {
            self.barrier.monitor.notify_all();
        }
    }
}

impl fmt::Debug for MutationPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationPermit").finish_non_exhaustive()
    }
}

/// Held while mutations are frozen; unfreezes on drop
#[must_use = "mutations unfreeze as soon as the freeze is dropped"]
pub struct MutationFreeze<'a> {
    barrier: &'a StateMutationBarrier,
}

impl Drop for MutationFreeze<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.monitor.lock();
        state.frozen = false;
        self.barrier.monitor.notify_all();
    }
}

impl fmt::Debug for MutationFreeze<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationFreeze").finish_non_exhaustive()
    }
}
