//! Master Invocations
//!
//! An [`Invocation`] asks the master thread to run an action on behalf of
//! another thread. Synchronous invocations block their creator until the
//! master has run the action and hand any panic back to it; asynchronous
//! invocations return immediately.
//!
//! Tokens are recycled through a pool owned by the creating thread. A token is
//! only reused once its creator holds the last handle to it, so the master can
//! never observe a token being reset underneath it.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracing::{debug, error};

use super::{lock, wait};
use crate::error::{FatalHandler, panic_message};

/// Action run on the master thread
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Panic captured while running an action
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// Fresh token allocations across all threads
static ALLOCATED: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static RECYCLED: RefCell<InvocationPool> = RefCell::new(InvocationPool::default());
}

/// How a synchronous invocation ended, as seen by its creator
#[derive(Debug)]
pub enum InvocationOutcome {
    /// The action ran to completion
    Completed,
    /// The action panicked; the payload belongs to the waiting caller
    Raised(PanicPayload),
    /// The pipeline was disposed before the master got to it
    Abandoned,
}

#[derive(Default)]
struct Completion {
    done: bool,
    abandoned: bool,
    raised: Option<PanicPayload>,
}

/// A request to run an action on the master thread
pub struct Invocation {
    action: Mutex<Option<Action>>,
    synchronous: bool,
    completion: Mutex<Completion>,
    completed: Condvar,
    async_done: AtomicBool,
}

impl Invocation {
    fn new(action: Action, synchronous: bool) -> Self {
        let allocated = ALLOCATED.fetch_add(1, Ordering::Relaxed) + 1;
        if allocated % 1024 == 0 {
            debug!(allocated, "master invocation tokens allocated");
        }

        Self {
            action: Mutex::new(Some(action)),
            synchronous,
            completion: Mutex::new(Completion::default()),
            completed: Condvar::new(),
            async_done: AtomicBool::new(false),
        }
    }

    fn reset(&mut self, action: Action, synchronous: bool) {
        *self.action.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(action);
        *self.completion.get_mut().unwrap_or_else(PoisonError::into_inner) = Completion::default();
        *self.async_done.get_mut() = false;
        self.synchronous = synchronous;
    }

    /// Take a token from the current thread's pool, or allocate one.
    ///
    /// Asynchronous tokens stay leased to this thread until the master marks
    /// them done; they are reclaimed on a later `create`.
    pub fn create<F>(action: F, synchronous: bool) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let action: Action = Box::new(action);
        RECYCLED.with(|pool| pool.borrow_mut().take(action, synchronous))
    }

    /// Return a completed synchronous token to the current thread's pool.
    ///
    /// Must be called by the creating thread after [`wait`](Self::wait).
    pub fn free(token: Arc<Self>) {
        debug_assert!(token.synchronous, "asynchronous tokens are reclaimed automatically");
        RECYCLED.with(|pool| pool.borrow_mut().free.push(token));
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    /// Whether the master has finished with this token
    pub fn is_complete(&self) -> bool {
        if self.synchronous {
            lock(&self.completion).done
        } else {
            self.async_done.load(Ordering::Acquire)
        }
    }

    /// Block until the master has run (or abandoned) a synchronous token.
    pub fn wait(&self) -> InvocationOutcome {
        let mut completion = lock(&self.completion);
        while !completion.done {
            completion = wait(&self.completed, completion);
        }
        if completion.abandoned {
            InvocationOutcome::Abandoned
        } else if let Some(payload) = completion.raised.take() {
            InvocationOutcome::Raised(payload)
        } else {
            InvocationOutcome::Completed
        }
    }

    /// Run the action on the master thread.
    ///
    /// A panic in a synchronous action is stored for the waiting caller. A
    /// panic in an asynchronous action has nobody to go to and is handed to
    /// `fatal`.
    pub(crate) fn dispatch(&self, fatal: &FatalHandler) {
        let action = lock(&self.action).take();
        let result = match action {
            Some(action) => panic::catch_unwind(AssertUnwindSafe(action)),
            None => Ok(()),
        };

        if self.synchronous {
            let mut completion = lock(&self.completion);
            completion.done = true;
            completion.raised = result.err();
            self.completed.notify_all();
            return;
        }

        self.async_done.store(true, Ordering::Release);
        if let Err(payload) = result {
            let message = format!(
                "panic raised in asynchronous master invocation: {}",
                panic_message(payload.as_ref())
            );
            error!("{}", message);
            fatal(&message);
        }
    }

    /// Release the token without running it.
    pub(crate) fn abandon(&self) {
        lock(&self.action).take();
        if self.synchronous {
            let mut completion = lock(&self.completion);
            completion.done = true;
            completion.abandoned = true;
            self.completed.notify_all();
        } else {
            self.async_done.store(true, Ordering::Release);
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raised = lock(&self.completion).raised.is_some();
        f.debug_struct("Invocation")
            .field("synchronous", &self.synchronous)
            .field("complete", &self.is_complete())
            .field("raised", &raised)
            .finish()
    }
}

/// Per-thread token pool
#[derive(Default)]
struct InvocationPool {
    free: Vec<Arc<Invocation>>,
    leased_async: Vec<Arc<Invocation>>,
}

impl InvocationPool {
    fn take(&mut self, action: Action, synchronous: bool) -> Arc<Invocation> {
        if self.free.is_empty() {
            self.reclaim_leased();
        }

        while let Some(mut token) = self.free.pop() {
            // Tokens the master still holds a handle to are dropped, not reused
            if let Some(inner) = Arc::get_mut(&mut token) {
                inner.reset(action, synchronous);
                return self.lease(token);
            }
        }

        let token = Arc::new(Invocation::new(action, synchronous));
        self.lease(token)
    }

    fn lease(&mut self, token: Arc<Invocation>) -> Arc<Invocation> {
        if !token.synchronous {
            self.leased_async.push(Arc::clone(&token));
        }
        token
    }

    fn reclaim_leased(&mut self) {
        let mut i = self.leased_async.len();
        while i > 0 {
            i -= 1;
            if self.leased_async[i].async_done.load(Ordering::Acquire) {
                let token = self.leased_async.swap_remove(i);
                self.free.push(token);
            }
        }
    }
}

/// Free and leased token counts for the current thread
#[cfg(test)]
pub(crate) fn pool_sizes() -> (usize, usize) {
    RECYCLED.with(|pool| {
        let pool = pool.borrow();
        (pool.free.len(), pool.leased_async.len())
    })
}
