//! Runs two modules for a short while.
//!
//! `RUST_LOG=debug cargo run -p fos-pipeline --example basic`

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use fos_pipeline::{Engine, EngineModule, ModuleTag, PipelineConfig, WorkerPool};
use tracing_subscriber::EnvFilter;

/// Integrates a cloud of particles on the pool every 16ms
struct Particles {
    positions: Vec<AtomicU64>,
    engine: Engine,
    frames: u32,
}

impl EngineModule for Particles {
    fn name(&self) -> &str {
        "particles"
    }

    fn tick_interval_ms(&self) -> u64 {
        16
    }

    fn on_tick(&mut self, pool: &WorkerPool, delta_ms: u64) -> Result<()> {
        let positions = &self.positions;
        pool.execute(positions.len(), 512, |i| {
            positions[i].fetch_add(delta_ms * (i as u64 % 7 + 1), Ordering::Relaxed);
        })?;

        self.frames += 1;
        if self.frames == 60 {
            let engine = self.engine.clone();
            pool.invoke_on_all(
                || {
                    // Hand the decision back to the master thread
                    let _ = engine.invoke_on_master_async({
                        let engine = engine.clone();
                        move || engine.exit()
                    });
                },
                false,
            )?;
        }
        Ok(())
    }
}

/// Reports progress once a second
#[derive(Default)]
struct Reporter {
    reports: u32,
}

impl EngineModule for Reporter {
    fn tick_interval_ms(&self) -> u64 {
        1000
    }

    fn on_tick(&mut self, pool: &WorkerPool, delta_ms: u64) -> Result<()> {
        self.reports += 1;
        tracing::info!(
            "report #{}: {}ms since last, {} pipeline threads",
            self.reports,
            delta_ms,
            pool.num_threads()
        );
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    let engine = Engine::with_config(config);
    engine.on_system_starting(|| tracing::info!("pipeline starting"));
    engine.on_system_exited(|| tracing::info!("pipeline exited"));

    let handle = engine.clone();
    engine.add_module_with(ModuleTag::named("particles"), move || Particles {
        positions: (0..100_000).map(|_| AtomicU64::new(0)).collect(),
        engine: handle,
        frames: 0,
    })?;
    engine.add_module::<Reporter>()?;

    engine.start()?;
    Ok(())
}
