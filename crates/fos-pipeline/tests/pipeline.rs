//! Integration tests - Engine, scheduler and worker pool working together
//!
//! Tests run a real engine on the test thread, which becomes its master.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use fos_pipeline::{
    Clock, Engine, EngineError, EngineModule, FatalHandler, ManualClock, ModuleTag, PipelineConfig,
    StateMutationBarrier, WorkerPool, default_fatal_handler, panic_message,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn engine(threads: usize) -> Engine {
    init_tracing();
    Engine::with_config(PipelineConfig::default().fixed_thread_count(threads))
}

/// Module that runs a closure on every tick
struct TickFn<F> {
    interval: u64,
    tick: F,
}

impl<F> EngineModule for TickFn<F>
where
    F: FnMut(&WorkerPool, u64) -> anyhow::Result<()> + Send,
{
    fn tick_interval_ms(&self) -> u64 {
        self.interval
    }

    fn on_tick(&mut self, pool: &WorkerPool, delta_ms: u64) -> anyhow::Result<()> {
        (self.tick)(pool, delta_ms)
    }
}

fn tick_fn<F>(interval: u64, tick: F) -> TickFn<F>
where
    F: FnMut(&WorkerPool, u64) -> anyhow::Result<()> + Send,
{
    TickFn { interval, tick }
}

fn idle() -> TickFn<impl FnMut(&WorkerPool, u64) -> anyhow::Result<()> + Send> {
    tick_fn(0, |_, _| Ok(()))
}

fn add_tick_fn<F>(engine: &Engine, name: &'static str, interval: u64, tick: F)
where
    F: FnMut(&WorkerPool, u64) -> anyhow::Result<()> + Send + 'static,
{
    engine
        .add_module_with(ModuleTag::named(name), move || tick_fn(interval, tick))
        .unwrap();
}

// ============================================================================
// WORKER POOL
// ============================================================================

#[test]
fn test_pool_spawns_one_less_than_thread_count() {
    init_tracing();
    for threads in [1, 2, 5] {
        let config = PipelineConfig::default().fixed_thread_count(threads);
        let pool = WorkerPool::new(&config, default_fatal_handler()).unwrap();
        assert_eq!(pool.num_threads(), threads);
        assert_eq!(pool.worker_count(), threads - 1);
    }
}

#[test]
fn test_execute_covers_every_index_exactly_once() {
    init_tracing();
    let config = PipelineConfig::default().fixed_thread_count(4);
    let pool = WorkerPool::new(&config, default_fatal_handler()).unwrap();

    for count in [0usize, 1, 2, 3, 31, 64, 257] {
        for block in [1usize, 2, 7, 64, 300] {
            let visits: Vec<AtomicUsize> = (0..count).map(|_| AtomicUsize::new(0)).collect();
            pool.execute(count, block, |i| {
                visits[i].fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
            for (i, v) in visits.iter().enumerate() {
                assert_eq!(v.load(Ordering::Relaxed), 1, "index {i} of ({count}, {block})");
            }
        }
    }
}

#[test]
fn test_execute_tail_runs_on_master_before_open() {
    init_tracing();
    let config = PipelineConfig::default().fixed_thread_count(4);
    let pool = WorkerPool::new(&config, default_fatal_handler()).unwrap();
    let master = thread::current().id();

    let tail = Mutex::new(Vec::new());
    let visits: Vec<AtomicUsize> = (0..23).map(|_| AtomicUsize::new(0)).collect();
    pool.execute(23, 5, |i| {
        visits[i].fetch_add(1, Ordering::SeqCst);
        if i >= 20 {
            tail.lock()
                .unwrap()
                .push((i, thread::current().id(), pool.barrier().is_open()));
        }
    })
    .unwrap();

    let mut tail = tail.into_inner().unwrap();
    tail.sort_by_key(|(i, _, _)| *i);
    assert_eq!(tail.len(), 3);
    for (i, (index, ran_on, open)) in tail.into_iter().enumerate() {
        assert_eq!(index, 20 + i);
        assert_eq!(ran_on, master);
        assert!(!open, "tail index {index} ran after the barrier opened");
    }
    assert!(visits.iter().all(|v| v.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_invoke_on_all_counts() {
    init_tracing();
    let config = PipelineConfig::default().fixed_thread_count(5);
    let pool = WorkerPool::new(&config, default_fatal_handler()).unwrap();

    for include_master in [true, false] {
        let threads = Mutex::new(Vec::new());
        pool.invoke_on_all(|| threads.lock().unwrap().push(thread::current().id()), include_master)
            .unwrap();
        let threads = threads.into_inner().unwrap();
        let distinct: HashSet<ThreadId> = threads.iter().copied().collect();

        let expected = if include_master { 5 } else { 4 };
        assert_eq!(threads.len(), expected);
        assert_eq!(distinct.len(), expected);
        assert_eq!(distinct.contains(&thread::current().id()), include_master);
    }
}

#[test]
fn test_forced_single_threaded_runs_on_master() {
    init_tracing();
    let config = PipelineConfig::default().fixed_thread_count(4);
    let pool = WorkerPool::new(&config, default_fatal_handler()).unwrap();
    pool.set_force_single_threaded(true);

    let threads = Mutex::new(HashSet::new());
    for _ in 0..50 {
        pool.invoke_on_all(|| { threads.lock().unwrap().insert(thread::current().id()); }, true)
            .unwrap();
        pool.execute(100, 1, |_| {
            threads.lock().unwrap().insert(thread::current().id());
        })
        .unwrap();
    }

    let threads = threads.into_inner().unwrap();
    assert_eq!(threads.len(), 1);
    assert!(threads.contains(&thread::current().id()));
}

// ============================================================================
// ENGINE LIFECYCLE
// ============================================================================

#[test]
fn test_duplicate_module_keeps_count() {
    let engine = engine(2);
    add_tick_fn(&engine, "only", 0, |_, _| Ok(()));
    let err = engine
        .add_module_with(ModuleTag::named("only"), idle)
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateModule(_)));
    assert_eq!(engine.module_count(), 1);
}

#[test]
fn test_start_without_modules_rejected() {
    let engine = engine(2);
    assert!(matches!(engine.start(), Err(EngineError::NoModules)));
    assert!(!engine.is_running());
}

#[test]
fn test_lifecycle_listeners_and_restart() {
    let engine = engine(3);
    let starting = Arc::new(AtomicUsize::new(0));
    let exited = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&starting);
    engine.on_system_starting(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&exited);
    engine.on_system_exited(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let handle = engine.clone();
    let ticks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&ticks);
    add_tick_fn(&engine, "stopper", 0, move |_, _| {
        if seen.fetch_add(1, Ordering::SeqCst) % 3 == 2 {
            handle.exit();
        }
        Ok(())
    });

    engine.start().unwrap();
    assert!(!engine.is_running());
    assert_eq!(engine.module_count(), 1);
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    // Modules survive a run, so the engine can start again
    engine.start().unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 6);
    assert_eq!(starting.load(Ordering::SeqCst), 2);
    assert_eq!(exited.load(Ordering::SeqCst), 2);
}

#[test]
fn test_registration_visible_during_run() {
    let engine = engine(2);
    let handle = engine.clone();
    let seen = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);
    add_tick_fn(&engine, "self", 0, move |_, _| {
        *record.lock().unwrap() = Some((handle.is_module_added(&ModuleTag::named("self")), handle.module_count()));
        handle.exit();
        Ok(())
    });

    engine.start().unwrap();
    assert_eq!(*seen.lock().unwrap(), Some((true, 1)));
}

#[test]
fn test_tick_error_propagates_from_start() {
    let engine = engine(2);
    add_tick_fn(&engine, "broken", 0, |_, _| anyhow::bail!("sensor offline"));

    let err = engine.start().unwrap_err();
    match err {
        EngineError::Module(e) => {
            let message = format!("{e:#}");
            assert!(message.contains("broken"));
            assert!(message.contains("sensor offline"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!engine.is_running());
    assert_eq!(engine.module_count(), 1);
}

#[test]
fn test_settings_rejected_while_running() {
    let engine = engine(2);
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let inner = engine.clone();
    let record = Arc::clone(&outcomes);
    add_tick_fn(&engine, "probe", 0, move |_, _| {
        let mut record = record.lock().unwrap();
        record.push(matches!(inner.set_max_thread_count(4), Err(EngineError::Running(_))));
        record.push(matches!(inner.set_thread_oversubscription(1), Err(EngineError::Running(_))));
        record.push(matches!(
            inner.set_config(PipelineConfig::default()),
            Err(EngineError::Running(_))
        ));
        record.push(matches!(
            inner.add_module_with(ModuleTag::named("late"), idle),
            Err(EngineError::Running(_))
        ));
        record.push(matches!(inner.start(), Err(EngineError::AlreadyRunning)));
        record.push(inner.is_running());
        inner.exit();
        Ok(())
    });

    engine.start().unwrap();
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 6);
    assert!(outcomes.iter().all(|&ok| ok), "{outcomes:?}");
    assert_eq!(engine.config().max_threads, 2);
}

// ============================================================================
// MASTER INVOCATIONS
// ============================================================================

#[test]
fn test_sync_invoke_from_workers_returns_value() {
    let engine = engine(4);
    let results = Arc::new(Mutex::new(Vec::new()));
    let master = thread::current().id();

    let inner = engine.clone();
    let record = Arc::clone(&results);
    add_tick_fn(&engine, "caller", 0, move |pool, _| {
        pool.invoke_on_all(
            || {
                let ran_on = inner.invoke_on_master(|| thread::current().id());
                record.lock().unwrap().push(ran_on.map_err(|e| e.to_string()));
            },
            false,
        )?;
        inner.exit();
        Ok(())
    });

    engine.start().unwrap();
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.as_ref() == Ok(&master)));
}

#[test]
fn test_sync_invoke_resumes_panic_on_caller() {
    let engine = engine(3);
    let messages = Arc::new(Mutex::new(Vec::new()));

    let inner = engine.clone();
    let record = Arc::clone(&messages);
    add_tick_fn(&engine, "thrower", 0, move |pool, _| {
        pool.invoke_on_all(
            || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    inner.invoke_on_master(|| -> u32 { panic!("master refused") })
                }));
                let message = match result {
                    Err(payload) => panic_message(payload.as_ref()),
                    Ok(_) => "no panic".to_string(),
                };
                record.lock().unwrap().push(message);
            },
            false,
        )?;
        inner.exit();
        Ok(())
    });

    engine.start().unwrap();
    let messages = messages.lock().unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m == "master refused"));
}

#[test]
fn test_async_invoke_observed_before_next_cycle() {
    let engine = engine(4);
    let observed = Arc::new(Mutex::new(Vec::new()));

    let inner = engine.clone();
    let record = Arc::clone(&observed);
    add_tick_fn(&engine, "async", 0, move |pool, _| {
        let applied = Arc::new(AtomicUsize::new(0));
        let master = thread::current().id();
        pool.invoke_on_all(
            || {
                let applied = Arc::clone(&applied);
                inner
                    .invoke_on_master_async(move || {
                        assert_eq!(thread::current().id(), master);
                        applied.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            },
            false,
        )?;
        record.lock().unwrap().push(applied.load(Ordering::SeqCst));
        inner.exit();
        Ok(())
    });

    engine.start().unwrap();
    assert_eq!(*observed.lock().unwrap(), vec![3]);
}

#[test]
fn test_async_panic_reaches_fatal_handler() {
    let engine = engine(2);
    let fatal_messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fatal_messages);
    let handler: FatalHandler = Arc::new(move |message: &str| {
        sink.lock().unwrap().push(message.to_string());
    });
    engine.set_fatal_handler(handler).unwrap();

    engine.invoke_on_master_async(|| panic!("lost in the queue")).unwrap();

    let fatal_messages = fatal_messages.lock().unwrap();
    assert_eq!(fatal_messages.len(), 1);
    assert!(fatal_messages[0].contains("lost in the queue"));
}

#[test]
fn test_invoke_from_stranger_rejected_when_stopped() {
    let engine = engine(2);
    engine.set_master_thread(thread::current().id()).unwrap();

    let remote = engine.clone();
    let result = thread::spawn(move || matches!(remote.invoke_on_master(|| 1), Err(EngineError::NotRunning)))
        .join()
        .unwrap();
    assert!(result);
}

// ============================================================================
// SCHEDULING
// ============================================================================

#[test]
fn test_tick_cadence_over_simulated_time() {
    let engine = engine(2);
    let clock = Arc::new(ManualClock::new());
    engine.set_clock(clock.clone()).unwrap();

    let counters: Vec<Arc<AtomicU64>> = (0..4).map(|_| Arc::new(AtomicU64::new(0))).collect();

    let driver_clock = Arc::clone(&clock);
    let driver_engine = engine.clone();
    let driver_count = Arc::clone(&counters[0]);
    add_tick_fn(&engine, "every-pass", 0, move |_, _| {
        driver_count.fetch_add(1, Ordering::SeqCst);
        driver_clock.advance(1);
        if driver_clock.elapsed_ms() >= 1050 {
            driver_engine.exit();
        }
        Ok(())
    });

    for (slot, (name, interval)) in [("every-10", 10), ("every-100", 100), ("every-1000", 1000)]
        .into_iter()
        .enumerate()
    {
        let count = Arc::clone(&counters[slot + 1]);
        add_tick_fn(&engine, name, interval, move |_, delta_ms| {
            assert!(delta_ms >= interval);
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    engine.start().unwrap();

    let ticks: Vec<u64> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    for (actual, expected) in ticks.iter().zip([1050u64, 105, 10, 1]) {
        assert!(
            actual.abs_diff(expected) <= 1,
            "expected ~{expected} ticks, got {actual} (all: {ticks:?})"
        );
    }
}

#[test]
fn test_pool_available_inside_ticks() {
    let engine = engine(4);
    let sums = Arc::new(Mutex::new(Vec::new()));

    let inner = engine.clone();
    let record = Arc::clone(&sums);
    add_tick_fn(&engine, "sum", 0, move |pool, _| {
        let total = AtomicUsize::new(0);
        pool.execute(1000, 16, |i| {
            total.fetch_add(i, Ordering::Relaxed);
        })?;
        let mut sums = record.lock().unwrap();
        sums.push(total.into_inner());
        if sums.len() == 5 {
            inner.exit();
        }
        Ok(())
    });

    engine.start().unwrap();
    assert_eq!(*sums.lock().unwrap(), vec![499_500; 5]);
}

// ============================================================================
// MUTATION FREEZE
// ============================================================================

#[test]
fn test_freeze_serves_invocations_from_permit_holder() {
    let engine = engine(2);
    let barrier = StateMutationBarrier::new();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (held_tx, held_rx) = mpsc::channel::<()>();

    let holder_engine = engine.clone();
    let holder_barrier = barrier.clone();
    let holder = thread::spawn(move || {
        go_rx.recv().unwrap();
        let permit = holder_barrier.acquire_permit();
        held_tx.send(()).unwrap();
        // Needs the master while the master is freezing
        let answer = holder_engine.invoke_on_master(|| 7);
        drop(permit);
        answer.map_err(|e| e.to_string())
    });

    let froze = Arc::new(AtomicBool::new(false));
    let inner = engine.clone();
    let frozen_flag = Arc::clone(&froze);
    add_tick_fn(&engine, "freezer", 0, move |_, _| {
        go_tx.send(()).ok();
        held_rx.recv()?;

        let freeze = barrier.freeze_mutations(&inner);
        frozen_flag.store(barrier.is_frozen() && barrier.active_permits() == 0, Ordering::SeqCst);
        drop(freeze);

        inner.exit();
        Ok(())
    });

    engine.start().unwrap();
    assert!(froze.load(Ordering::SeqCst));
    assert_eq!(holder.join().unwrap(), Ok(7));
}
