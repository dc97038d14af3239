//! fOS Pipeline
//!
//! Master-thread tick scheduler with a fork-join worker pool.
//!
//! # Model
//! - One master thread runs every module's tick, in registration order
//! - Each module sets its own minimum tick interval
//! - Inside a tick, modules fan work out over the worker pool with
//!   [`WorkerPool::execute`] and [`WorkerPool::invoke_on_all`]
//! - Any thread can hand work back to the master with
//!   [`Engine::invoke_on_master`]
//!
//! # Example
//! ```rust,ignore
//! use fos_pipeline::{Engine, EngineModule, WorkerPool};
//!
//! #[derive(Default)]
//! struct Physics;
//!
//! impl EngineModule for Physics {
//!     fn tick_interval_ms(&self) -> u64 { 16 }
//!
//!     fn on_tick(&mut self, pool: &WorkerPool, delta_ms: u64) -> anyhow::Result<()> {
//!         pool.execute(10_000, 256, |body| step(body, delta_ms))?;
//!         Ok(())
//!     }
//! }
//!
//! let engine = Engine::new();
//! engine.add_module::<Physics>()?;
//! engine.start()?;
//! ```

mod config;
mod engine;
mod error;
mod module;
mod mutation;
pub mod thread;

pub use config::{PipelineConfig, WorkerPriority, logical_cores, num_threads_for};
pub use engine::Engine;
pub use error::{ConfigError, EngineError, FatalHandler, default_fatal_handler, panic_message};
pub use module::{EngineModule, ModuleTag};
pub use mutation::{MutationFreeze, MutationPermit, StateMutationBarrier};
pub use thread::{
    Clock, ManualClock, MonotonicClock, SchedulerHandle, TickScheduler, WorkerPool,
    current_worker_index,
};

/// Pipeline version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
