//! Result model: per-test outcomes, per-suite aggregates, and the streaming
//! record form written to the result stream.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Local timestamp in RFC 3339 form, microsecond precision.
pub fn now_timestamp() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Result of a single test execution. Immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub name: String,
    pub passed: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub start_time: String,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
    /// Exit code of the test command; 0 when no process ran.
    pub exit_code: i32,
}

impl TestOutcome {
    /// A failed outcome for a test that never ran a command.
    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            duration: Duration::ZERO,
            start_time: now_timestamp(),
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// Whether this outcome records a test that was skipped rather than run.
    pub fn is_skip(&self) -> bool {
        self.message.starts_with("Skipped")
    }
}

/// Aggregate result of one suite.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteOutcome {
    pub name: String,
    pub container: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub results: Vec<TestOutcome>,
}

impl SuiteOutcome {
    /// Build the aggregate from a suite's completed outcomes.
    ///
    /// Skipped tests count toward `failed` as well as `skipped`: a skip is a
    /// test that was declared but never given a chance to pass.
    pub fn from_results(
        name: String,
        container: String,
        duration: Duration,
        results: Vec<TestOutcome>,
    ) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.iter().filter(|r| !r.passed).count();
        let skipped = results.iter().filter(|r| r.is_skip()).count();
        Self {
            name,
            container,
            total: results.len(),
            passed,
            failed,
            skipped,
            duration,
            results,
        }
    }
}

/// One line of the streaming result output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub suite: String,
    pub container: String,
    pub test: String,
    pub passed: bool,
    pub start_time: String,
    /// Wall-clock seconds.
    pub duration: f64,
    pub message: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TestRecord {
    pub fn new(suite: &str, container: &str, outcome: &TestOutcome) -> Self {
        Self {
            suite: suite.to_string(),
            container: container.to_string(),
            test: outcome.name.clone(),
            passed: outcome.passed,
            start_time: outcome.start_time.clone(),
            duration: outcome.duration.as_secs_f64(),
            message: outcome.message.clone(),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
        }
    }
}
