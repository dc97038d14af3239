//! Engine - Pipeline entry point
//!
//! [`Engine`] is a cheap, cloneable context. Modules are added up front from
//! the master thread, [`Engine::start`] blocks that thread in the tick loop,
//! and any clone can ask the master to run work or stop.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use tracing::{debug, info};

use crate::config::{PipelineConfig, WorkerPriority};
use crate::error::{EngineError, FatalHandler, default_fatal_handler};
use crate::module::{EngineModule, ModuleRegistry, ModuleTag, RegisteredModule};
use crate::thread::{Clock, Invocation, RendezvousBarrier, SchedulerHandle, TickScheduler, lock};

/// Lifecycle listener
type Listener = Arc<dyn Fn() + Send + Sync>;

struct EngineState {
    config: PipelineConfig,
    modules: ModuleRegistry,
    master: Option<ThreadId>,
    running: bool,
    exit_requested: Option<Arc<AtomicBool>>,
    active: Option<SchedulerHandle>,
    clock: Option<Arc<dyn Clock>>,
    fatal: FatalHandler,
    starting_listeners: Vec<Listener>,
    exited_listeners: Vec<Listener>,
}

impl EngineState {
    /// The first thread to call a master-only operation becomes the master.
    fn claim_master(&mut self, operation: &'static str) -> Result<ThreadId, EngineError> {
        let current = thread::current().id();
        match self.master {
            None => {
                debug!("Master thread set to {:?}", current);
                self.master = Some(current);
                Ok(current)
            }
            Some(master) if master == current => Ok(current),
            Some(_) => Err(EngineError::NotMasterThread(operation)),
        }
    }

    fn ensure_stopped(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.running {
            return Err(EngineError::Running(operation));
        }
        Ok(())
    }
}

/// A reserved module tag whose module is still being built.
///
/// Dropping it without [`complete`](Self::complete) frees the tag again.
struct PendingModule<'a> {
    engine: &'a Engine,
    tag: Option<ModuleTag>,
}

impl PendingModule<'_> {
    fn complete(mut self, module: Box<dyn EngineModule>) {
        if let Some(tag) = self.tag.take() {
            info!("Module added: {}", tag);
            self.engine.state().modules.fill(tag, module);
        }
    }
}

impl Drop for PendingModule<'_> {
    fn drop(&mut self) {
        if let Some(tag) = self.tag.take() {
            self.engine.state().modules.release(&tag);
        }
    }
}

/// Where an invocation should go
enum Route {
    /// Run on the calling thread, which is the master
    Inline,
    Scheduler(SchedulerHandle),
}

/// The pipeline engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Mutex<EngineState>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Engine")
            .field("modules", &state.modules)
            .field("master", &state.master)
            .field("running", &state.running)
            .field("config", &state.config)
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        info!("fOS Pipeline {} initialized", crate::VERSION);
        Self {
            inner: Arc::new(Mutex::new(EngineState {
                config,
                modules: ModuleRegistry::default(),
                master: None,
                running: false,
                exit_requested: None,
                active: None,
                clock: None,
                fatal: default_fatal_handler(),
                starting_listeners: Vec::new(),
                exited_listeners: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.inner)
    }

    /// Add a module of type `M`, tagged by its type.
    pub fn add_module<M>(&self) -> Result<(), EngineError>
    where
        M: EngineModule + Default + 'static,
    {
        self.add_module_with(ModuleTag::of::<M>(), M::default)
    }

    /// Add the module built by `factory` under `tag`.
    ///
    /// Master-only, and only while stopped. The tag is reserved before
    /// `factory` runs, so `on_registered` is only called on a module that
    /// will be stored.
    pub fn add_module_with<M, F>(&self, tag: ModuleTag, factory: F) -> Result<(), EngineError>
    where
        M: EngineModule + 'static,
        F: FnOnce() -> M,
    {
        let pending = {
            let mut state = self.state();
            if state.modules.contains(&tag) {
                return Err(EngineError::DuplicateModule(tag.to_string()));
            }
            state.ensure_stopped("add modules")?;
            state.claim_master("add modules")?;
            state.modules.reserve(tag.clone())?;
            PendingModule { engine: self, tag: Some(tag) }
        };

        // Built without the engine lock so the module may call back into it
        let mut module = factory();
        module.on_registered();
        pending.complete(Box::new(module));
        Ok(())
    }

    pub fn is_module_added(&self, tag: &ModuleTag) -> bool {
        self.state().modules.contains(tag)
    }

    pub fn is_module_type_added<M: ?Sized>(&self) -> bool {
        self.is_module_added(&ModuleTag::of::<M>())
    }

    /// Modules registered with this engine, including while it runs
    pub fn module_count(&self) -> usize {
        self.state().modules.len()
    }

    /// Run the pipeline on the calling thread until [`exit`](Self::exit).
    ///
    /// Returns the first module error, if any. A module panic is resumed here
    /// after the pool has been shut down.
    pub fn start(&self) -> Result<(), EngineError> {
        let starting = {
            let mut state = self.state();
            state.claim_master("start the pipeline")?;
            if state.running {
                return Err(EngineError::AlreadyRunning);
            }
            if state.modules.is_empty() {
                return Err(EngineError::NoModules);
            }
            state.starting_listeners.clone()
        };

        info!("System starting");
        for listener in &starting {
            listener();
        }

        let (mut modules, config, fatal, clock, exit_requested) = {
            let mut state = self.state();
            if state.running {
                return Err(EngineError::AlreadyRunning);
            }
            if state.modules.is_empty() {
                return Err(EngineError::NoModules);
            }
            let exit_requested = Arc::new(AtomicBool::new(false));
            state.running = true;
            state.exit_requested = Some(Arc::clone(&exit_requested));
            (
                state.modules.take_all(),
                state.config.clone(),
                Arc::clone(&state.fatal),
                state.clock.clone(),
                exit_requested,
            )
        };

        let scheduler = TickScheduler::new(&mut modules, &config, fatal, exit_requested);
        let mut scheduler = match scheduler {
            Ok(scheduler) => scheduler,
            Err(e) => {
                self.finish_run(modules);
                return Err(e);
            }
        };
        if let Some(clock) = clock {
            scheduler = scheduler.with_clock(clock);
        }
        self.state().active = Some(scheduler.handle());

        let result = panic::catch_unwind(AssertUnwindSafe(|| scheduler.run()));
        let exited = self.finish_run(scheduler.into_modules());

        let result = match result {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        };

        for listener in &exited {
            listener();
        }
        match &result {
            Ok(()) => info!("System exited"),
            Err(e) => info!("System exited with error: {}", e),
        }
        result
    }

    /// Return the modules and clear the running state. Yields the exit
    /// listeners to fire.
    fn finish_run(&self, modules: Vec<RegisteredModule>) -> Vec<Listener> {
        let mut state = self.state();
        if !modules.is_empty() {
            state.modules.restore(modules);
        }
        state.running = false;
        state.active = None;
        state.exit_requested = None;
        state.exited_listeners.clone()
    }

    /// Ask the pipeline to stop after the current pass. No-op when stopped.
    pub fn exit(&self) {
        let state = self.state();
        match &state.exit_requested {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!("Exit requested");
            }
            None => debug!("Exit requested while the pipeline is not running"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Handle to the running scheduler, if any
    pub fn scheduler_handle(&self) -> Option<SchedulerHandle> {
        self.state().active.clone()
    }

    pub(crate) fn active_barrier(&self) -> Option<Arc<RendezvousBarrier>> {
        self.state().active.as_ref().map(|handle| Arc::clone(handle.barrier()))
    }

    fn route(&self) -> Result<Route, EngineError> {
        let mut state = self.state();
        if let Some(handle) = &state.active {
            return Ok(Route::Scheduler(handle.clone()));
        }
        if state.running {
            // Between start() and the scheduler coming up
            return match state.master {
                Some(master) if master == thread::current().id() => Ok(Route::Inline),
                _ => Err(EngineError::NotRunning),
            };
        }
        state
            .claim_master("invoke on master")
            .map(|_| Route::Inline)
            .map_err(|_| EngineError::NotRunning)
    }

    /// Run `action` on the master thread and return its result.
    ///
    /// Blocks until the master has run it. A panic in `action` is resumed on
    /// the calling thread.
    pub fn invoke_on_master<F, R>(&self, action: F) -> Result<R, EngineError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let handle = match self.route()? {
            Route::Inline => return Ok(action()),
            Route::Scheduler(handle) => handle,
        };

        let slot = Arc::new(Mutex::new(None));
        let output = Arc::clone(&slot);
        let token = Invocation::create(move || *lock(&output) = Some(action()), true);
        handle.invoke_on_master(token)?;

        let value = lock(&slot).take();
        value.ok_or(EngineError::Disposed)
    }

    /// Queue `action` for the master thread and return immediately.
    ///
    /// A panic in `action` goes to the fatal handler.
    pub fn invoke_on_master_async<F>(&self, action: F) -> Result<(), EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let route = self.route()?;
        let token = Invocation::create(action, false);
        match route {
            Route::Inline => {
                let fatal = Arc::clone(&self.state().fatal);
                token.dispatch(&fatal);
                Ok(())
            }
            Route::Scheduler(handle) => handle.invoke_on_master(token),
        }
    }

    pub fn master_thread(&self) -> Option<ThreadId> {
        self.state().master
    }

    /// Fix the master thread. Setting the same thread again is a no-op.
    pub fn set_master_thread(&self, id: ThreadId) -> Result<(), EngineError> {
        let mut state = self.state();
        match state.master {
            Some(master) if master != id => Err(EngineError::MasterAlreadySet(master)),
            _ => {
                state.master = Some(id);
                Ok(())
            }
        }
    }

    pub fn on_system_starting<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state().starting_listeners.push(Arc::new(listener));
    }

    pub fn on_system_exited<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state().exited_listeners.push(Arc::new(listener));
    }

    /// Get the engine configuration
    pub fn config(&self) -> PipelineConfig {
        self.state().config.clone()
    }

    pub fn set_config(&self, config: PipelineConfig) -> Result<(), EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        let mut state = self.state();
        state.ensure_stopped("change the configuration")?;
        state.config = config;
        Ok(())
    }

    pub fn set_max_thread_count(&self, max_threads: usize) -> Result<(), EngineError> {
        let mut state = self.state();
        state.ensure_stopped("change the thread count")?;
        if max_threads == 0 {
            return Err(EngineError::InvalidConfig("max thread count must be positive".to_string()));
        }
        state.config.max_threads = max_threads;
        Ok(())
    }

    pub fn set_thread_oversubscription(&self, oversubscription: isize) -> Result<(), EngineError> {
        let mut state = self.state();
        state.ensure_stopped("change thread oversubscription")?;
        state.config.oversubscription = oversubscription;
        Ok(())
    }

    pub fn set_worker_priority(&self, priority: WorkerPriority) -> Result<(), EngineError> {
        let mut state = self.state();
        state.ensure_stopped("change the worker priority")?;
        state.config.worker_priority = priority;
        Ok(())
    }

    /// Time source for the tick loop
    pub fn set_clock(&self, clock: Arc<dyn Clock>) -> Result<(), EngineError> {
        let mut state = self.state();
        state.ensure_stopped("change the clock")?;
        state.clock = Some(clock);
        Ok(())
    }

    /// Called when an asynchronous master invocation panics
    pub fn set_fatal_handler(&self, handler: FatalHandler) -> Result<(), EngineError> {
        let mut state = self.state();
        state.ensure_stopped("change the fatal handler")?;
        state.fatal = handler;
        Ok(())
    }
}
