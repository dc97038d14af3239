//! Pipeline Configuration

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Requested scheduling priority for worker threads.
///
/// std exposes no portable thread priority, so this is recorded on the pool
/// and reported in logs rather than applied to the OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPriority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

/// Pipeline configuration options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on pipeline threads, master included. Must be positive.
    pub max_threads: usize,

    /// Threads created in excess of the logical core count (negative undersubscribes)
    pub oversubscription: isize,

    /// Priority requested for worker threads
    pub worker_priority: WorkerPriority,

    /// Worker threads are named `<prefix>-<index>`
    pub thread_name_prefix: String,

    /// How long shutdown waits for workers before giving up with a warning
    pub worker_exit_timeout_ms: u64,

    /// Module ticks slower than this are reported (None disables)
    pub stall_warning_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_threads: 64,
            oversubscription: 0,
            worker_priority: WorkerPriority::Normal,
            thread_name_prefix: "fos-worker".to_string(),
            worker_exit_timeout_ms: 4000,
            stall_warning_ms: Some(4000),
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read pipeline config at {:?}: {}", path, source);
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::from_toml_str(&content)
    }

    /// Pin the pool to exactly `threads` threads regardless of core count.
    pub fn fixed_thread_count(mut self, threads: usize) -> Self {
        self.max_threads = threads.max(1);
        self.oversubscription = isize::try_from(self.max_threads).unwrap_or(isize::MAX);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::Invalid("max_threads must be positive".to_string()));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::Invalid("thread_name_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Number of pipeline threads (master included) this config yields on this machine
    pub fn num_threads(&self) -> usize {
        num_threads_for(logical_cores(), self.oversubscription, self.max_threads)
    }

    pub fn worker_exit_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_exit_timeout_ms)
    }

    pub fn stall_warning(&self) -> Option<Duration> {
        self.stall_warning_ms.map(Duration::from_millis)
    }
}

/// Get the number of available CPU cores
pub fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// `clamp(cores + oversubscription, 1, max_threads)`
pub fn num_threads_for(cores: usize, oversubscription: isize, max_threads: usize) -> usize {
    let cores = isize::try_from(cores).unwrap_or(isize::MAX);
    let wanted = cores.saturating_add(oversubscription).max(1) as usize;
    wanted.min(max_threads.max(1))
}
