//! Tick Scheduler
//!
//! The master loop. Every pass walks the modules in registration order, ticks
//! each one whose interval has elapsed, then serves invocations queued by
//! other threads.

use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};

use super::{Invocation, InvocationOutcome, RendezvousBarrier, WorkerPool};
use crate::config::PipelineConfig;
use crate::error::{EngineError, FatalHandler};
use crate::module::{EngineModule, ModuleTag, RegisteredModule};

/// Millisecond time source for the tick loop
pub trait Clock: Send + Sync {
    fn elapsed_ms(&self) -> u64;
}

/// Wall-clock time since creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn elapsed_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Cloneable access to a running scheduler from any thread
#[derive(Clone)]
pub struct SchedulerHandle {
    barrier: Arc<RendezvousBarrier>,
    exit_requested: Arc<AtomicBool>,
    fatal: FatalHandler,
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("master", &self.barrier.master())
            .field("exit_requested", &self.is_exit_requested())
            .finish()
    }
}

impl SchedulerHandle {
    /// Stop after the current pass
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    pub fn master_thread(&self) -> ThreadId {
        self.barrier.master()
    }

    pub fn is_master_thread(&self) -> bool {
        self.barrier.is_master_thread()
    }

    pub(crate) fn barrier(&self) -> &Arc<RendezvousBarrier> {
        &self.barrier
    }

    /// Run `token` on the master thread.
    ///
    /// On the master it runs inline. Elsewhere it is queued; a synchronous
    /// token then blocks until the master has run it, is returned to this
    /// thread's pool, and any panic it raised is resumed here.
    pub fn invoke_on_master(&self, token: Arc<Invocation>) -> Result<(), EngineError> {
        if self.barrier.is_master_thread() {
            token.dispatch(&self.fatal);
        } else if let Err(e) = self.barrier.worker_queue_on_master(Arc::clone(&token)) {
            // Never queued, so nobody else will complete it
            token.abandon();
            if token.is_synchronous() {
                Invocation::free(token);
            }
            return Err(e);
        }

        if !token.is_synchronous() {
            return Ok(());
        }

        let outcome = token.wait();
        Invocation::free(token);
        match outcome {
            InvocationOutcome::Completed => Ok(()),
            InvocationOutcome::Raised(payload) => panic::resume_unwind(payload),
            InvocationOutcome::Abandoned => Err(EngineError::Disposed),
        }
    }
}

/// A module plus its tick bookkeeping
struct ScheduledModule {
    tag: ModuleTag,
    module: Box<dyn EngineModule>,
    last_tick_ms: u64,
    ticks: u64,
}

/// Owns the modules and the worker pool for one run of the pipeline
pub struct TickScheduler {
    modules: Vec<ScheduledModule>,
    pool: WorkerPool,
    clock: Arc<dyn Clock>,
    handle: SchedulerHandle,
    stall_warning: Option<Duration>,
}

impl fmt::Debug for TickScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickScheduler")
            .field("modules", &self.modules.iter().map(|m| &m.tag).collect::<Vec<_>>())
            .field("pool", &self.pool)
            .field("stall_warning", &self.stall_warning)
            .finish()
    }
}

impl TickScheduler {
    /// Build the scheduler and spawn its pool. The calling thread becomes the
    /// master.
    ///
    /// Fails with [`EngineError::NoModules`] before any thread is spawned.
    /// `modules` is only drained once the pool is up.
    pub(crate) fn new(
        modules: &mut Vec<RegisteredModule>,
        config: &PipelineConfig,
        fatal: FatalHandler,
        exit_requested: Arc<AtomicBool>,
    ) -> Result<Self, EngineError> {
        if modules.is_empty() {
            return Err(EngineError::NoModules);
        }

        let pool = WorkerPool::new(config, Arc::clone(&fatal))?;
        let handle = SchedulerHandle {
            barrier: Arc::clone(pool.barrier()),
            exit_requested,
            fatal,
        };
        let modules = std::mem::take(modules)
            .into_iter()
            .map(|(tag, module)| ScheduledModule {
                tag,
                module,
                last_tick_ms: 0,
                ticks: 0,
            })
            .collect();

        Ok(Self {
            modules,
            pool,
            clock: Arc::new(MonotonicClock::new()),
            handle,
            stall_warning: config.stall_warning(),
        })
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Ticks each module has received, in registration order
    pub fn tick_counts(&self) -> Vec<(ModuleTag, u64)> {
        self.modules.iter().map(|m| (m.tag.clone(), m.ticks)).collect()
    }

    /// Run the master loop until exit is requested or a module fails, then
    /// shut the pool down.
    pub fn run(&mut self) -> Result<(), EngineError> {
        if !self.handle.is_master_thread() {
            return Err(EngineError::NotMasterThread("run the tick scheduler"));
        }

        info!(
            "Tick scheduler running {} module(s) on {} thread(s)",
            self.modules.len(),
            self.pool.num_threads()
        );
        let result = self.run_passes();
        self.shutdown();
        result
    }

    fn run_passes(&mut self) -> Result<(), EngineError> {
        while !self.handle.is_exit_requested() {
            for scheduled in &mut self.modules {
                let now = self.clock.elapsed_ms();
                let delta_ms = now.saturating_sub(scheduled.last_tick_ms);
                if delta_ms < scheduled.module.tick_interval_ms() {
                    continue;
                }

                let started = Instant::now();
                scheduled
                    .module
                    .on_tick(&self.pool, delta_ms)
                    .with_context(|| format!("module '{}' failed to tick", scheduled.tag))?;
                scheduled.last_tick_ms = now;
                scheduled.ticks += 1;

                if let Some(limit) = self.stall_warning {
                    let took = started.elapsed();
                    if took > limit {
                        warn!(
                            "Module '{}' stalled the pipeline: tick took {}ms (limit {}ms)",
                            scheduled.module.name(),
                            took.as_millis(),
                            limit.as_millis()
                        );
                    }
                }
            }

            self.pool.barrier().master_hydrate_queue_non_blocking();
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.pool.barrier().master_hydrate_queue_non_blocking();
        self.pool.dispose();
        self.pool.wait_for_workers_to_exit(self.pool.exit_timeout());
        debug!("Tick scheduler stopped");
    }

    /// Give the modules back once the run is over
    pub(crate) fn into_modules(self) -> Vec<RegisteredModule> {
        self.modules
            .into_iter()
            .map(|scheduled| (scheduled.tag, scheduled.module))
            .collect()
    }
}
