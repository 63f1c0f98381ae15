//! Scheduling and aggregation.
//!
//! Two operating modes share the per-unit execution contract. Sequential
//! mode runs suites one at a time, reporting each result in declaration
//! order. Parallel mode prepares every suite up front, shuffles the
//! combined unit list so no single container monopolizes the pool, and
//! fans the units across a fixed number of worker threads. Either way,
//! every declared test contributes exactly one outcome to the stream.

use crate::executor;
use crate::loader::{self, LoadError};
use crate::outcome::{SuiteOutcome, TestOutcome, TestRecord};
use crate::prepare::{self, AbandonedSuite, PreparedSuite, PreparedTestUnit};
use crate::report::ResultSink;
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Live, shared view of an in-flight run, constructed once per run and
/// injected into the scheduler. The running-test registry is advisory — it
/// feeds progress display and diagnostics, never correctness decisions.
#[derive(Default)]
pub struct RunState {
    running: Mutex<BTreeSet<String>>,
    completed: AtomicUsize,
    passed: AtomicUsize,
    failed: AtomicUsize,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, key: &str) {
        self.running
            .lock()
            .expect("run state lock poisoned")
            .insert(key.to_string());
    }

    fn finish(&self, key: &str, passed: bool) {
        self.running
            .lock()
            .expect("run state lock poisoned")
            .remove(key);
        self.record(passed);
    }

    /// Count a completed outcome without touching the registry; synthetic
    /// outcomes for abandoned suites never begin executing.
    fn record(&self, passed: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if passed {
            self.passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Keys of tests currently executing.
    pub fn running_tests(&self) -> Vec<String> {
        self.running
            .lock()
            .expect("run state lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// (completed, passed, failed) counters.
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.completed.load(Ordering::Relaxed),
            self.passed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// Options governing one run.
pub struct RunOptions {
    /// Worker count; 1 selects sequential mode.
    pub jobs: usize,
    /// Case-insensitive test-name filter.
    pub filter: Option<Regex>,
    pub containers_dir: PathBuf,
    pub work_dir: PathBuf,
}

/// Execute every suite and return per-suite aggregates.
pub fn run_suites(
    paths: &[PathBuf],
    opts: &RunOptions,
    state: &RunState,
    sink: &dyn ResultSink,
) -> Vec<SuiteOutcome> {
    if opts.jobs > 1 {
        run_parallel(paths, opts, state, sink)
    } else {
        run_sequential(paths, opts, state, sink)
    }
}

fn run_sequential(
    paths: &[PathBuf],
    opts: &RunOptions,
    state: &RunState,
    sink: &dyn ResultSink,
) -> Vec<SuiteOutcome> {
    let mut all = Vec::new();

    for path in paths {
        let suite_start = Instant::now();
        let loaded = match loader::load_suite(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                all.push(record_load_failure(path, &e, state, sink));
                continue;
            }
        };

        info!(suite = %loaded.name(), "running suite");
        match prepare::prepare_suite(&loaded, &opts.containers_dir, &opts.work_dir, opts.filter.as_ref())
        {
            Ok(prepared) => {
                let mut results = Vec::with_capacity(prepared.units.len());
                for unit in &prepared.units {
                    results.push(dispatch(unit, state, sink));
                }
                prepare::run_cleanup(&prepared);
                all.push(SuiteOutcome::from_results(
                    prepared.name,
                    prepared.container_name,
                    suite_start.elapsed(),
                    results,
                ));
            }
            Err(abandoned) => all.push(record_abandoned(&abandoned, state, sink)),
        }
    }

    all
}

fn run_parallel(
    paths: &[PathBuf],
    opts: &RunOptions,
    state: &RunState,
    sink: &dyn ResultSink,
) -> Vec<SuiteOutcome> {
    let mut all = Vec::new();
    let mut prepared_suites: Vec<PreparedSuite> = Vec::new();
    let mut units: Vec<PreparedTestUnit> = Vec::new();

    // Preparation failures are recorded but never block other suites.
    for path in paths {
        match loader::load_suite(path) {
            Ok(loaded) => match prepare::prepare_suite(
                &loaded,
                &opts.containers_dir,
                &opts.work_dir,
                opts.filter.as_ref(),
            ) {
                Ok(mut prepared) => {
                    units.append(&mut prepared.units);
                    prepared_suites.push(prepared);
                }
                Err(abandoned) => all.push(record_abandoned(&abandoned, state, sink)),
            },
            Err(e) => all.push(record_load_failure(path, &e, state, sink)),
        }
    }

    // Spread load: without the shuffle, a pool would chew through one
    // container's tests back to back and starve the rest.
    units.shuffle(&mut rand::thread_rng());
    info!(units = units.len(), workers = opts.jobs, "dispatching prepared tests");

    let completed = execute_pool(units, opts.jobs, state, sink);

    let mut by_suite: HashMap<String, Vec<TestOutcome>> = HashMap::new();
    for (suite, outcome) in completed {
        by_suite.entry(suite).or_default().push(outcome);
    }

    for prepared in &prepared_suites {
        let results = by_suite.remove(&prepared.name).unwrap_or_default();
        let duration: Duration = results.iter().map(|r| r.duration).sum();
        prepare::run_cleanup(prepared);
        all.push(SuiteOutcome::from_results(
            prepared.name.clone(),
            prepared.container_name.clone(),
            duration,
            results,
        ));
    }

    all
}

/// Fan units across a fixed-size pool. Returns (suite name, outcome) pairs
/// in completion order.
fn execute_pool(
    units: Vec<PreparedTestUnit>,
    workers: usize,
    state: &RunState,
    sink: &dyn ResultSink,
) -> Vec<(String, TestOutcome)> {
    let queue: Mutex<VecDeque<PreparedTestUnit>> = Mutex::new(units.into());
    let completed: Mutex<Vec<(String, TestOutcome)>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            scope.spawn(|| {
                loop {
                    let unit = queue.lock().expect("unit queue lock poisoned").pop_front();
                    let Some(unit) = unit else { break };
                    let outcome = dispatch(&unit, state, sink);
                    completed
                        .lock()
                        .expect("completed lock poisoned")
                        .push((unit.suite_name, outcome));
                }
            });
        }
    });

    completed.into_inner().expect("completed lock poisoned")
}

/// Run one unit under the live registry and emit its record. The registry
/// insert/remove brackets the execution; the lock is never held across it.
fn dispatch(unit: &PreparedTestUnit, state: &RunState, sink: &dyn ResultSink) -> TestOutcome {
    let key = format!("{}: {}", unit.suite_name, unit.test.name);
    state.begin(&key);
    debug!(running = ?state.running_tests(), "dispatching");

    let outcome = executor::run_unit(unit);

    state.finish(&key, outcome.passed);
    sink.emit(&TestRecord::new(
        &unit.suite_name,
        &unit.container_name,
        &outcome,
    ));
    outcome
}

/// Record an abandoned suite: its synthetic outcomes flow through the same
/// counters and sink as real ones.
fn record_abandoned(
    abandoned: &AbandonedSuite,
    state: &RunState,
    sink: &dyn ResultSink,
) -> SuiteOutcome {
    record_synthetic(
        &abandoned.name,
        &abandoned.container_name,
        abandoned.outcomes(),
        state,
        sink,
    )
}

/// Record a suite file that failed to parse as a single synthetic failure;
/// the test list is unknowable.
fn record_load_failure(
    path: &Path,
    error: &LoadError,
    state: &RunState,
    sink: &dyn ResultSink,
) -> SuiteOutcome {
    let name = loader::suite_name_for_path(path);
    let outcome = TestOutcome::failed("Suite preparation", error.to_string());
    record_synthetic(&name, "", vec![outcome], state, sink)
}

fn record_synthetic(
    suite: &str,
    container: &str,
    outcomes: Vec<TestOutcome>,
    state: &RunState,
    sink: &dyn ResultSink,
) -> SuiteOutcome {
    for outcome in &outcomes {
        state.record(outcome.passed);
        sink.emit(&TestRecord::new(suite, container, outcome));
    }
    SuiteOutcome::from_results(
        suite.to_string(),
        container.to_string(),
        Duration::ZERO,
        outcomes,
    )
}

/// Total failed tests across all suites; the run fails iff this is nonzero.
pub fn total_failed(suites: &[SuiteOutcome]) -> usize {
    suites.iter().map(|s| s.failed).sum()
}
