//! Rendezvous Barrier
//!
//! Two-phase barrier between the master thread and the pool workers, plus the
//! queue through which any other thread asks the master to run something.
//!
//! The master opens a cycle, does its share of the work and then waits for
//! the cycle to close. While it waits it keeps draining the invocation queue,
//! so a worker that needs the master mid-cycle is served instead of
//! deadlocking against the very thread that is waiting on it.
//!
//! Lock order is `reopen` before `cycle`, and `cycle` before `external`.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use super::{Invocation, lock, wait};
use crate::error::{EngineError, FatalHandler};

/// A mutex and the condition variable that goes with it.
///
/// Code that holds a monitor's lock and has to wait for a condition on the
/// master thread can do so through
/// [`RendezvousBarrier::master_wait_on_external`] without going deaf to
/// queued invocations.
pub struct Monitor<T> {
    state: Mutex<T>,
    signal: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(value),
            signal: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        lock(&self.state)
    }

    /// Wait for a notification. `guard` must come from this monitor.
    pub fn wait<'a>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        wait(&self.signal, guard)
    }

    /// Wake every waiter. Callers normally hold the lock.
    pub fn notify_all(&self) {
        self.signal.notify_all();
    }
}

impl<T: Default> Default for Monitor<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Monitor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor").field("state", &*self.lock()).finish()
    }
}

/// Type-erased wake-up for a registered external monitor
trait Pulse: Send + Sync {
    fn pulse_all(&self);
}

impl<T: Send> Pulse for Monitor<T> {
    fn pulse_all(&self) {
        let _guard = self.lock();
        self.signal.notify_all();
    }
}

/// Identifies the cycle a worker has most recently joined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTicket(u64);

/// Open/close state and the invocation queue
struct CycleState {
    open: bool,
    workers_remaining: usize,
    queue: VecDeque<Arc<Invocation>>,
    accepting: bool,
}

/// What workers wait on between cycles
struct ReopenState {
    generation: u64,
    disposed: bool,
}

/// Master/worker rendezvous barrier
pub struct RendezvousBarrier {
    num_workers: usize,
    master: ThreadId,
    cycle: Mutex<CycleState>,
    /// Pulsed when the cycle closes or an invocation is queued
    master_signal: Condvar,
    reopen: Mutex<ReopenState>,
    /// Pulsed when a cycle opens or the barrier is disposed
    worker_signal: Condvar,
    external: Mutex<Option<Arc<dyn Pulse>>>,
    fatal: FatalHandler,
}

impl fmt::Debug for RendezvousBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cycle = lock(&self.cycle);
        f.debug_struct("RendezvousBarrier")
            .field("num_workers", &self.num_workers)
            .field("open", &cycle.open)
            .field("workers_remaining", &cycle.workers_remaining)
            .field("queued", &cycle.queue.len())
            .finish()
    }
}

impl RendezvousBarrier {
    /// Create a closed barrier for `num_workers` workers, owned by `master`.
    pub fn new(num_workers: usize, master: ThreadId, fatal: FatalHandler) -> Self {
        Self {
            num_workers,
            master,
            cycle: Mutex::new(CycleState {
                open: false,
                workers_remaining: 0,
                queue: VecDeque::new(),
                accepting: true,
            }),
            master_signal: Condvar::new(),
            reopen: Mutex::new(ReopenState {
                generation: 0,
                disposed: false,
            }),
            worker_signal: Condvar::new(),
            external: Mutex::new(None),
            fatal,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn master(&self) -> ThreadId {
        self.master
    }

    pub fn is_master_thread(&self) -> bool {
        thread::current().id() == self.master
    }

    pub fn is_open(&self) -> bool {
        lock(&self.cycle).open
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.reopen).disposed
    }

    /// Invocations waiting for the master
    pub fn queued_invocations(&self) -> usize {
        lock(&self.cycle).queue.len()
    }

    fn assert_master(&self, operation: &str) {
        assert!(
            self.is_master_thread(),
            "RendezvousBarrier::{operation} called off the master thread"
        );
    }

    fn assert_not_master(&self, operation: &str) {
        assert!(
            !self.is_master_thread(),
            "RendezvousBarrier::{operation} called on the master thread"
        );
    }

    /// Open a cycle and release every waiting worker.
    ///
    /// A barrier without workers never opens.
    pub fn master_open(&self) {
        self.assert_master("master_open");
        let mut reopen = lock(&self.reopen);
        assert!(!reopen.disposed, "rendezvous barrier opened after disposal");

        {
            let mut cycle = lock(&self.cycle);
            assert!(!cycle.open, "rendezvous barrier opened twice in one cycle");
            if self.num_workers > 0 {
                cycle.open = true;
                cycle.workers_remaining = self.num_workers;
            }
        }

        reopen.generation += 1;
        self.worker_signal.notify_all();
    }

    /// Block until every worker has checked in, serving queued invocations
    /// on every wake-up.
    pub fn master_wait_for_close(&self) {
        self.assert_master("master_wait_for_close");
        let mut cycle = lock(&self.cycle);
        loop {
            let next = cycle.queue.pop_front();
            if let Some(token) = next {
                drop(cycle);
                token.dispatch(&self.fatal);
                cycle = lock(&self.cycle);
                continue;
            }
            if !cycle.open {
                return;
            }
            cycle = wait(&self.master_signal, cycle);
        }
    }

    /// Wait on an external monitor the master already holds, until
    /// `predicate` is satisfied, serving queued invocations meanwhile.
    ///
    /// While registered, the monitor is pulsed whenever an invocation is
    /// queued. Queued actions run with the monitor's lock held, so they must
    /// not take that lock themselves.
    pub fn master_wait_on_external<'a, T, P>(
        &self,
        monitor: &Arc<Monitor<T>>,
        mut guard: MutexGuard<'a, T>,
        mut predicate: P,
    ) -> MutexGuard<'a, T>
    where
        T: Send + 'static,
        P: FnMut(&mut T) -> bool,
    {
        self.assert_master("master_wait_on_external");
        let pulse: Arc<dyn Pulse> = monitor.clone();
        *lock(&self.external) = Some(pulse);

        loop {
            self.drain_queue();
            if predicate(&mut *guard) {
                break;
            }
            guard = monitor.wait(guard);
        }

        lock(&self.external).take();
        guard
    }

    /// Serve whatever is queued right now without waiting.
    pub fn master_hydrate_queue_non_blocking(&self) {
        self.assert_master("master_hydrate_queue_non_blocking");
        self.drain_queue();
    }

    fn drain_queue(&self) {
        loop {
            let next = lock(&self.cycle).queue.pop_front();
            match next {
                Some(token) => token.dispatch(&self.fatal),
                None => break,
            }
        }
    }

    /// Block a freshly started worker until the first cycle opens.
    ///
    /// Returns `None` once the barrier is disposed.
    pub fn worker_wait_first_open(&self) -> Option<CycleTicket> {
        self.assert_not_master("worker_wait_first_open");
        let mut reopen = lock(&self.reopen);
        while reopen.generation == 0 && !reopen.disposed {
            reopen = wait(&self.worker_signal, reopen);
        }
        if reopen.disposed {
            None
        } else {
            Some(CycleTicket(reopen.generation))
        }
    }

    /// Check out of cycle `ticket` and block until the next one opens.
    ///
    /// The last worker to check out closes the cycle and wakes the master.
    /// Returns `None` once the barrier is disposed.
    pub fn worker_wait_for_reset(&self, ticket: CycleTicket) -> Option<CycleTicket> {
        self.assert_not_master("worker_wait_for_reset");
        let mut reopen = lock(&self.reopen);

        // Always check out, even after disposal, so a master waiting on this
        // cycle is never left behind.
        {
            let mut cycle = lock(&self.cycle);
            debug_assert!(cycle.open && cycle.workers_remaining > 0);
            cycle.workers_remaining -= 1;
            if cycle.workers_remaining == 0 {
                cycle.open = false;
                self.master_signal.notify_all();
            }
        }

        // Disposal is re-checked under the same lock, so it can not slip in
        // between checking out and going to sleep.
        while reopen.generation == ticket.0 && !reopen.disposed {
            reopen = wait(&self.worker_signal, reopen);
        }
        if reopen.disposed {
            None
        } else {
            Some(CycleTicket(reopen.generation))
        }
    }

    /// Hand an invocation to the master thread.
    pub fn worker_queue_on_master(&self, token: Arc<Invocation>) -> Result<(), EngineError> {
        self.assert_not_master("worker_queue_on_master");
        let external = {
            let mut cycle = lock(&self.cycle);
            if !cycle.accepting {
                return Err(EngineError::Disposed);
            }
            cycle.queue.push_back(token);
            self.master_signal.notify_all();
            lock(&self.external).clone()
        };

        if let Some(external) = external {
            external.pulse_all();
        }
        Ok(())
    }

    /// Permanently retire the barrier and release every blocked worker.
    ///
    /// Invocations still queued are served when called on the master, and
    /// abandoned otherwise so their callers do not wait forever.
    pub fn dispose(&self) {
        {
            let mut reopen = lock(&self.reopen);
            reopen.disposed = true;
            self.worker_signal.notify_all();
        }

        let leftover = {
            let mut cycle = lock(&self.cycle);
            cycle.accepting = false;
            mem::take(&mut cycle.queue)
        };

        let on_master = self.is_master_thread();
        for token in leftover {
            if on_master {
                token.dispatch(&self.fatal);
            } else {
                token.abandon();
            }
        }
    }
}
