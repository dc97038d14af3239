//! Fork-Join Worker Pool
//!
//! A fixed set of worker threads that join the master for one fork-join cycle
//! at a time. Work is either a per-index function split into blocks that
//! threads claim from a shared counter, or a broadcast action every worker runs
//! once.

use std::cell::Cell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{PanicPayload, RendezvousBarrier, lock};
use crate::config::{PipelineConfig, WorkerPriority};
use crate::error::{EngineError, FatalHandler};

const NO_WORKER: usize = usize::MAX;

thread_local! {
    static WORKER_INDEX: Cell<usize> = const { Cell::new(NO_WORKER) };
}

/// Index of the pool worker running on this thread, if any.
///
/// The master thread and unrelated threads see `None`.
pub fn current_worker_index() -> Option<usize> {
    let index = WORKER_INDEX.with(Cell::get);
    (index != NO_WORKER).then_some(index)
}

fn set_current_worker_index(index: Option<usize>) {
    WORKER_INDEX.with(|cell| cell.set(index.unwrap_or(NO_WORKER)));
}

/// Work for the cycle in flight.
///
/// The references only live for one cycle; the master keeps the real closure
/// alive until every worker has checked out.
#[derive(Clone, Copy)]
enum Work {
    Blocks {
        action: &'static (dyn Fn(usize) + Sync),
        block_size: usize,
    },
    Broadcast(&'static (dyn Fn() + Sync)),
}

/// State shared between the master and the workers
struct PoolShared {
    barrier: Arc<RendezvousBarrier>,
    work: Mutex<Option<Work>>,
    reservable_blocks: AtomicIsize,
    disposed: AtomicBool,
    running_workers: Mutex<usize>,
    workers_exited: Condvar,
    worker_panic: Mutex<Option<PanicPayload>>,
}

impl PoolShared {
    /// Claim blocks until the counter runs dry.
    fn claim_blocks(&self, action: &(dyn Fn(usize) + Sync), block_size: usize) {
        loop {
            let block = self.reservable_blocks.fetch_sub(1, Ordering::AcqRel) - 1;
            if block < 0 {
                break;
            }
            let start = block as usize * block_size;
            for index in start..start + block_size {
                action(index);
            }
        }
    }

    fn run_work(&self, work: Work) {
        match work {
            Work::Blocks { action, block_size } => self.claim_blocks(action, block_size),
            Work::Broadcast(action) => action(),
        }
    }

    /// A worker's share of the current cycle
    fn run_assigned_work(&self) {
        let work = *lock(&self.work);
        let Some(work) = work else {
            return;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.run_work(work))) {
            debug!("Worker panicked during a fork-join cycle");
            let mut slot = lock(&self.worker_panic);
            if slot.is_none() {
                *slot = Some(payload);
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

fn worker_main(index: usize, shared: Arc<PoolShared>) {
    set_current_worker_index(Some(index));

    if let Some(mut ticket) = shared.barrier.worker_wait_first_open() {
        while !shared.disposed.load(Ordering::Acquire) {
            shared.run_assigned_work();
            match shared.barrier.worker_wait_for_reset(ticket) {
                Some(next) => ticket = next,
                None => break,
            }
        }
    }

    set_current_worker_index(None);
    let mut running = lock(&shared.running_workers);
    *running -= 1;
    shared.workers_exited.notify_all();
    drop(running);

    let current = thread::current();
    debug!(
        "Worker thread {} has exited normally",
        current.name().unwrap_or("<unnamed>")
    );
}

/// Fork-join pool of `num_threads - 1` workers plus the master thread
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<Worker>,
    num_threads: usize,
    force_single_threaded: AtomicBool,
    cycle_in_flight: AtomicBool,
    worker_priority: WorkerPriority,
    exit_timeout: Duration,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("num_threads", &self.num_threads)
            .field("force_single_threaded", &self.is_single_threaded())
            .field("worker_priority", &self.worker_priority)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn the workers. The calling thread becomes the pool's master.
    pub fn new(config: &PipelineConfig, fatal: FatalHandler) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        let num_threads = config.num_threads();
        let num_workers = num_threads - 1;
        let barrier = Arc::new(RendezvousBarrier::new(
            num_workers,
            thread::current().id(),
            fatal,
        ));
        let shared = Arc::new(PoolShared {
            barrier,
            work: Mutex::new(None),
            reservable_blocks: AtomicIsize::new(0),
            disposed: AtomicBool::new(false),
            running_workers: Mutex::new(0),
            workers_exited: Condvar::new(),
            worker_panic: Mutex::new(None),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(num_workers),
            num_threads,
            force_single_threaded: AtomicBool::new(false),
            cycle_in_flight: AtomicBool::new(false),
            worker_priority: config.worker_priority,
            exit_timeout: config.worker_exit_timeout(),
        };

        for id in 0..num_workers {
            let shared = Arc::clone(&pool.shared);
            *lock(&pool.shared.running_workers) += 1;
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, id))
                .spawn(move || worker_main(id, shared));

            match spawned {
                Ok(thread) => pool.workers.push(Worker {
                    id,
                    thread: Some(thread),
                }),
                Err(e) => {
                    *lock(&pool.shared.running_workers) -= 1;
                    // Drop disposes and joins whatever was spawned so far
                    return Err(EngineError::Spawn(e));
                }
            }
        }

        info!(
            "Worker pool started: {} threads ({} workers, {:?} priority)",
            num_threads, num_workers, pool.worker_priority
        );
        Ok(pool)
    }

    fn ensure_ready(&self, operation: &'static str) -> Result<(), EngineError> {
        if !self.shared.barrier.is_master_thread() {
            return Err(EngineError::NotMasterThread(operation));
        }
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        if self.cycle_in_flight.load(Ordering::Acquire) {
            return Err(EngineError::CycleInFlight(operation));
        }
        Ok(())
    }

    /// Call `action(i)` exactly once for every `i` in `0..item_count`.
    ///
    /// Indices are handed out `block_size` at a time. The leftover tail runs on
    /// the master before any worker is released; the full blocks are then
    /// claimed by the master and the workers from a shared counter. Returns
    /// once every index has been visited. A panic in `action` on any thread is
    /// resumed here after the cycle closes.
    pub fn execute<F>(&self, item_count: usize, block_size: usize, action: F) -> Result<(), EngineError>
    where
        F: Fn(usize) + Sync,
    {
        self.ensure_ready("execute")?;
        if block_size == 0 {
            return Err(EngineError::InvalidConfig("block_size must be positive".to_string()));
        }

        let full_blocks = item_count / block_size;
        for index in full_blocks * block_size..item_count {
            action(index);
        }
        if full_blocks == 0 {
            return Ok(());
        }

        let full_blocks = isize::try_from(full_blocks)
            .map_err(|_| EngineError::InvalidConfig(format!("too many blocks: {full_blocks}")))?;
        self.shared.reservable_blocks.store(full_blocks, Ordering::Release);

        if self.runs_on_master_only() {
            self.shared.claim_blocks(&action, block_size);
            return Ok(());
        }

        let action: &(dyn Fn(usize) + Sync) = &action;
        // SAFETY: run_cycle does not return before every worker has checked
        // out of the cycle and the work slot has been cleared, so the erased
        // reference never outlives `action`.
        let action: &'static (dyn Fn(usize) + Sync) = unsafe { mem::transmute(action) };
        self.run_cycle(Work::Blocks { action, block_size }, true);
        Ok(())
    }

    /// Run `action` once on every worker, and on the master too when
    /// `include_master` is set.
    pub fn invoke_on_all<F>(&self, action: F, include_master: bool) -> Result<(), EngineError>
    where
        F: Fn() + Sync,
    {
        self.ensure_ready("invoke_on_all")?;

        if self.runs_on_master_only() {
            if include_master {
                action();
            }
            return Ok(());
        }

        let action: &(dyn Fn() + Sync) = &action;
        // SAFETY: as in `execute`, the cycle is closed before `action` drops.
        let action: &'static (dyn Fn() + Sync) = unsafe { mem::transmute(action) };
        self.run_cycle(Work::Broadcast(action), include_master);
        Ok(())
    }

    fn runs_on_master_only(&self) -> bool {
        self.workers.is_empty() || self.is_single_threaded()
    }

    fn run_cycle(&self, work: Work, include_master: bool) {
        let shared = &self.shared;
        *lock(&shared.work) = Some(work);
        self.cycle_in_flight.store(true, Ordering::Release);

        shared.barrier.master_open();
        let master_result = if include_master {
            panic::catch_unwind(AssertUnwindSafe(|| shared.run_work(work)))
        } else {
            Ok(())
        };
        shared.barrier.master_wait_for_close();

        lock(&shared.work).take();
        self.cycle_in_flight.store(false, Ordering::Release);

        if let Err(payload) = master_result {
            lock(&shared.worker_panic).take();
            panic::resume_unwind(payload);
        }
        let worker_panic = lock(&shared.worker_panic).take();
        if let Some(payload) = worker_panic {
            panic::resume_unwind(payload);
        }
    }

    /// Run all work on the master, leaving the workers parked.
    pub fn set_force_single_threaded(&self, forced: bool) {
        self.force_single_threaded.store(forced, Ordering::Release);
    }

    pub fn is_single_threaded(&self) -> bool {
        self.force_single_threaded.load(Ordering::Acquire)
    }

    /// Threads taking part in a cycle, master included
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_priority(&self) -> WorkerPriority {
        self.worker_priority
    }

    pub fn master_thread(&self) -> ThreadId {
        self.shared.barrier.master()
    }

    pub fn barrier(&self) -> &Arc<RendezvousBarrier> {
        &self.shared.barrier
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Release the workers. They exit at their next rendezvous point.
    pub fn dispose(&mut self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.barrier.dispose();
    }

    /// Wait up to `timeout` for every worker to exit.
    ///
    /// Returns whether they all did; a timeout is only logged.
    pub fn wait_for_workers_to_exit(&self, timeout: Duration) -> bool {
        let running = lock(&self.shared.running_workers);
        let (running, result) = self
            .shared
            .workers_exited
            .wait_timeout_while(running, timeout, |running| *running > 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if result.timed_out() {
            warn!(
                "{} worker thread(s) did not exit cleanly within {}ms",
                *running,
                timeout.as_millis()
            );
            return false;
        }
        true
    }

    /// Configured bound for [`wait_for_workers_to_exit`](Self::wait_for_workers_to_exit)
    pub fn exit_timeout(&self) -> Duration {
        self.exit_timeout
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.dispose();
        if !self.wait_for_workers_to_exit(self.exit_timeout) {
            // Stuck workers are detached rather than joined
            return;
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
