//! Stress runs for Ripple.
//!
//! Several threads run read-modify-write transactions against the same
//! fields. Conflicted transactions are retried, so every increment must
//! land exactly once. Readers racing a writer must never be served a
//! cached render older than the state their view reads.

use ripple_core::{CoreResult, Engine, ObjectHandle, ObjectType, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Transactions that applied.
    pub applied: usize,
    /// Attempts discarded by a conflict and retried.
    pub conflicts: usize,
    /// Transactions that failed for any other reason.
    pub failed: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    /// Applied transactions per second.
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.applied as f64 / secs
        } else {
            0.0
        }
    }

    /// Logs a summary of the run.
    pub fn log_summary(&self, name: &str) {
        info!(
            run = name,
            applied = self.applied,
            conflicts = self.conflicts,
            failed = self.failed,
            duration_ms = u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            ops_per_second = self.ops_per_second(),
            "stress run finished"
        );
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Transactions per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of counter objects the threads spread their writes over.
    pub objects: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            objects: 2,
        }
    }
}

/// Builds the `Counter` type: one integer field, `count`.
pub fn counter_type() -> Arc<ObjectType> {
    ObjectType::builder("Counter").field("count").build()
}

/// Creates `n` counters starting at zero.
pub fn create_counters(engine: &Engine, n: usize) -> CoreResult<Vec<ObjectHandle>> {
    let ty = counter_type();
    engine.transaction("create counters", |ctx| {
        (0..n)
            .map(|_| ctx.create(&ty, [("count", Value::from(0i64))]))
            .collect()
    })
}

/// Reads the sum of every counter's `count`.
pub fn counter_total(engine: &Engine, counters: &[ObjectHandle]) -> CoreResult<i64> {
    let view = engine.view();
    counters.iter().try_fold(0i64, |total, counter| {
        Ok(total + view.get(counter, "count")?.as_integer().unwrap_or(0))
    })
}

/// Runs `config.threads` threads, each incrementing counters
/// `config.operations` times, retrying on conflict.
pub fn stress_concurrent_increments(
    engine: &Engine,
    counters: &[ObjectHandle],
    config: &StressConfig,
) -> StressTestResult {
    let applied = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let engine = engine.clone();
            let counters = counters.to_vec();
            let applied = Arc::clone(&applied);
            let conflicts = Arc::clone(&conflicts);
            let failed = Arc::clone(&failed);
            let operations = config.operations;

            thread::spawn(move || {
                for i in 0..operations {
                    let counter = &counters[(t + i) % counters.len()];
                    loop {
                        let result = engine.transaction("increment", |ctx| {
                            ctx.update(counter, "count", |count| {
                                *count = Value::from(count.as_integer().unwrap_or(0) + 1);
                            })
                        });
                        match result {
                            Ok(()) => {
                                applied.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                            Err(err) if err.is_conflict() => {
                                conflicts.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e));
    }

    StressTestResult {
        applied: applied.load(Ordering::Relaxed),
        conflicts: conflicts.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        duration: start.elapsed(),
    }
}

/// Runs readers that open views while writers commit, and reports how many
/// views saw a value change under them.
pub fn stress_view_stability(engine: &Engine, counter: &ObjectHandle, config: &StressConfig) -> usize {
    let unstable = Arc::new(AtomicUsize::new(0));
    let writer = {
        let engine = engine.clone();
        let counter = counter.clone();
        let operations = config.operations;
        thread::spawn(move || {
            for _ in 0..operations {
                let _ = engine.transaction("bump", |ctx| {
                    ctx.update(&counter, "count", |count| {
                        *count = Value::from(count.as_integer().unwrap_or(0) + 1);
                    })
                });
            }
        })
    };

    let readers: Vec<_> = (0..config.threads)
        .map(|_| {
            let engine = engine.clone();
            let counter = counter.clone();
            let unstable = Arc::clone(&unstable);
            let operations = config.operations;
            thread::spawn(move || {
                for _ in 0..operations {
                    let view = engine.view();
                    let first = view.get(&counter, "count");
                    thread::yield_now();
                    let second = view.get(&counter, "count");
                    if first != second {
                        unstable.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap_or_else(|e| std::panic::resume_unwind(e));
    for reader in readers {
        reader.join().unwrap_or_else(|e| std::panic::resume_unwind(e));
    }
    unstable.load(Ordering::Relaxed)
}

/// Outcome of [`stress_render_freshness`].
#[derive(Debug, Clone, Default)]
pub struct FreshnessResult {
    /// Renders checked.
    pub renders: usize,
    /// Renders that did not show the title read in the same view.
    pub stale: usize,
    /// Renames or renders that returned an error.
    pub failed: usize,
}

/// Renames a `Demo` `config.operations` times while `config.threads`
/// readers each open views, read the title, and render.
///
/// Every render must show the title its own view read.
pub fn stress_render_freshness(engine: &Engine, demo: &ObjectHandle, config: &StressConfig) -> FreshnessResult {
    let renders = Arc::new(AtomicUsize::new(0));
    let stale = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let writer = {
        let engine = engine.clone();
        let demo = demo.clone();
        let failed = Arc::clone(&failed);
        let operations = config.operations;
        thread::spawn(move || {
            for i in 0..operations {
                if engine.call(&demo, "rename", &[Value::from(format!("title {i}"))]).is_err() {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };

    let readers: Vec<_> = (0..config.threads)
        .map(|_| {
            let engine = engine.clone();
            let demo = demo.clone();
            let renders = Arc::clone(&renders);
            let stale = Arc::clone(&stale);
            let failed = Arc::clone(&failed);
            let operations = config.operations;
            thread::spawn(move || {
                for _ in 0..operations {
                    let view = engine.view();
                    let rendered = view
                        .get(&demo, "title")
                        .and_then(|title| Ok((title, view.call(&demo, "render", &[])?)));
                    match rendered {
                        Ok((title, html)) => {
                            renders.fetch_add(1, Ordering::Relaxed);
                            let expected = format!("<h1>{title}</h1>");
                            if !html.as_text().is_some_and(|html| html.contains(&expected)) {
                                stale.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap_or_else(|e| std::panic::resume_unwind(e));
    for reader in readers {
        reader.join().unwrap_or_else(|e| std::panic::resume_unwind(e));
    }
    FreshnessResult {
        renders: renders.load(Ordering::Relaxed),
        stale: stale.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
    }
}
