//! Result emission: the [`ResultSink`] capability and the run-level writers.
//!
//! Sequential and parallel execution share one seam: the scheduler calls
//! `emit` exactly once per completed test, under whatever interleaving the
//! run produces, and each sink serializes its own writes. What a record
//! becomes — a console line, a JSONL line, an entry in a test's capture
//! buffer — is the sink's business.

use crate::outcome::{self, SuiteOutcome, TestRecord};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// A capability for streaming completed test records out of the scheduler.
pub trait ResultSink: Send + Sync {
    fn emit(&self, record: &TestRecord);
}

/// Discards every record.
pub struct NullSink;

impl ResultSink for NullSink {
    fn emit(&self, _record: &TestRecord) {}
}

/// Appends one JSON object per record, flushed per record so the stream
/// survives an interrupted run.
pub struct JsonlSink {
    file: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            file: Mutex::new(BufWriter::new(File::create(path)?)),
        })
    }
}

impl ResultSink for JsonlSink {
    fn emit(&self, record: &TestRecord) {
        let mut file = self.file.lock().expect("jsonl sink lock poisoned");
        if let Ok(line) = serde_json::to_string(record) {
            let _ = writeln!(file, "{line}");
            let _ = file.flush();
        }
    }
}

/// Prints one PASS/FAIL line per record.
pub struct ConsoleSink {
    /// Hide passing tests.
    pub failed_only: bool,
}

impl ResultSink for ConsoleSink {
    fn emit(&self, record: &TestRecord) {
        if record.passed && self.failed_only {
            return;
        }
        let status = if record.passed { "PASS" } else { "FAIL" };
        // One write call per record so concurrent completions never
        // interleave partial lines.
        let mut line = format!(
            "  {status} {}: {} ({:.2}s)\n",
            record.suite, record.test, record.duration
        );
        if !record.passed {
            line.push_str(&format!("    {}\n", record.message));
        }
        print!("{line}");
    }
}

/// Captures records in memory; lets tests assert on emission counts.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<TestRecord>>,
}

#[cfg_attr(not(test), allow(dead_code))]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TestRecord> {
        self.records.lock().expect("memory sink lock poisoned").clone()
    }
}

impl ResultSink for MemorySink {
    fn emit(&self, record: &TestRecord) {
        self.records
            .lock()
            .expect("memory sink lock poisoned")
            .push(record.clone());
    }
}

/// Fans every record out to several sinks in order.
pub struct MultiSink {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Box<dyn ResultSink>>) -> Self {
        Self { sinks }
    }
}

impl ResultSink for MultiSink {
    fn emit(&self, record: &TestRecord) {
        for sink in &self.sinks {
            sink.emit(record);
        }
    }
}

/// Write the aggregate run summary document.
pub fn write_summary_json(
    path: &Path,
    suites: &[SuiteOutcome],
    total_duration: Duration,
) -> std::io::Result<()> {
    let total_tests: usize = suites.iter().map(|s| s.total).sum();
    let tests_passed: usize = suites.iter().map(|s| s.passed).sum();
    let tests_failed: usize = suites.iter().map(|s| s.failed).sum();
    let suites_passed = suites.iter().filter(|s| s.failed == 0).count();
    let suites_failed = suites.len() - suites_passed;

    let doc = serde_json::json!({
        "summary": {
            "total_suites": suites.len(),
            "suites_passed": suites_passed,
            "suites_failed": suites_failed,
            "total_tests": total_tests,
            "tests_passed": tests_passed,
            "tests_failed": tests_failed,
            "duration": total_duration.as_secs_f64(),
            "run_timestamp": outcome::now_timestamp(),
        },
        "suites": suites.iter().map(|suite| {
            serde_json::json!({
                "name": suite.name,
                "container": suite.container,
                "total": suite.total,
                "passed": suite.passed,
                "failed": suite.failed,
                "duration": suite.duration.as_secs_f64(),
                "tests": suite.results.iter().map(|test| {
                    serde_json::json!({
                        "name": test.name,
                        "passed": test.passed,
                        "start_time": test.start_time,
                        "duration": test.duration.as_secs_f64(),
                        "message": test.message,
                    })
                }).collect::<Vec<_>>(),
            })
        }).collect::<Vec<_>>(),
    });

    let pretty = serde_json::to_string_pretty(&doc).map_err(std::io::Error::other)?;
    std::fs::write(path, pretty)
}

/// Write the line-oriented text log, one pipe-delimited line per test,
/// suites sorted by name.
pub fn write_log(
    path: &Path,
    suites: &[SuiteOutcome],
    total_duration: Duration,
) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);

    writeln!(out, "# Container Test Results")?;
    writeln!(out, "# Generated: {}", outcome::now_timestamp())?;
    writeln!(out, "# Total Duration: {:.2}s", total_duration.as_secs_f64())?;
    writeln!(out, "#")?;
    writeln!(
        out,
        "# Format: STATE | START_TIME | DURATION | SUITE | TEST_NAME | MESSAGE"
    )?;
    writeln!(out, "#")?;
    writeln!(out)?;

    let mut sorted: Vec<&SuiteOutcome> = suites.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    for suite in sorted {
        for test in &suite.results {
            let state = if test.passed { "PASS" } else { "FAIL" };
            writeln!(
                out,
                "{state} | {} | {:.3}s | {} | {} | {}",
                test.start_time,
                test.duration.as_secs_f64(),
                suite.name,
                test.name,
                test.message
            )?;
        }
    }

    out.flush()
}
