//! Pipeline errors

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::ThreadId;

/// Errors returned by the engine facade, the scheduler and the worker pool.
///
/// Everything here is recoverable misuse rejected at the call site. Broken
/// internal invariants panic instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("module '{0}' already added")]
    DuplicateModule(String),

    #[error("at least one module must be added before the pipeline can start")]
    NoModules,

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("can not {0} while the pipeline is running")]
    Running(&'static str),

    #[error("invalid cross-thread invocation: {0} can only be performed from the master thread")]
    NotMasterThread(&'static str),

    #[error("master thread has already been set to {0:?}")]
    MasterAlreadySet(ThreadId),

    #[error(
        "can not invoke on master from a non-master thread while the pipeline is not running; \
         start the system or move the operation to the master thread"
    )]
    NotRunning,

    #[error("master invocation rejected: the pipeline has been disposed")]
    Disposed,

    #[error("a fork-join cycle is already in flight; {0} can not be nested inside it")]
    CycleInFlight(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Module(#[from] anyhow::Error),
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Called when an asynchronous master invocation panics.
///
/// There is no caller left to hand the panic back to, so the default handler
/// terminates the process.
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub fn default_fatal_handler() -> FatalHandler {
    Arc::new(exit_with_error)
}

fn exit_with_error(message: &str) {
    tracing::error!("Fatal pipeline error, exiting: {}", message);
    std::process::exit(1);
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
