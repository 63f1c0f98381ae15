//! Single-test execution.
//!
//! Each test becomes a self-contained bash script materialized at a unique
//! path in the work directory, executed inside the container when one is
//! bound, and evaluated against the declared expectations. A fault in one
//! test never escapes this module: every failure path is converted into a
//! failed [`TestOutcome`].

use crate::container;
use crate::nifti;
use crate::outcome::{self, TestOutcome};
use crate::prepare::PreparedTestUnit;
use crate::schema::{TestCase, Validation};
use crate::vars;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Preview length for quoted substrings in failure messages.
const SUBSTRING_PREVIEW_LEN: usize = 50;

/// Captured result of a finished child process.
pub struct CapturedOutput {
    /// Exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Timeout after {0}s")]
    Timeout(u64),
    #[error("Failed to wait for child: {0}")]
    Wait(#[source] std::io::Error),
}

/// Run a command to completion, killing it once `timeout` elapses.
///
/// stdout and stderr are drained on reader threads while the exit poll
/// loop runs, so a chatty child cannot fill a pipe and wedge the engine.
pub fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> Result<CapturedOutput, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout.join();
                    let _ = stderr.join();
                    return Err(ExecError::Timeout(timeout.as_secs()));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(ExecError::Wait(e)),
        }
    };

    Ok(CapturedOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run one prepared test unit to completion.
pub fn run_unit(unit: &PreparedTestUnit) -> TestOutcome {
    let name = &unit.test.name;
    let start_time = outcome::now_timestamp();
    let start = Instant::now();
    debug!(suite = %unit.suite_name, test = %name, "executing test");

    if unit.test.command.is_empty() {
        return TestOutcome::failed(name, "No command specified");
    }

    let command = vars::substitute(&unit.test.command, &unit.variables);
    let env_setup = unit
        .test
        .env_setup
        .as_deref()
        .or(unit.env_setup.as_deref())
        .unwrap_or("");
    let env_setup = vars::substitute(env_setup, &unit.variables);

    // The script handle unlinks itself on drop, pass or fail.
    let script = match write_script(&unit.work_dir, &env_setup, &command) {
        Ok(script) => script,
        Err(e) => {
            return early_failure(
                name,
                &start_time,
                start.elapsed(),
                format!("Failed to create test script: {e}"),
            );
        }
    };

    let mut cmd = match &unit.container_path {
        Some(image) => {
            let binds = container::bind_mounts(&unit.work_dir, &unit.variables);
            container::exec_command(image, script.path(), &binds)
        }
        None => {
            let mut cmd = Command::new("bash");
            cmd.arg(script.path());
            cmd
        }
    };
    cmd.current_dir(&unit.work_dir);

    let timeout_secs = unit.test.timeout.unwrap_or(unit.default_timeout);
    let output = match run_with_timeout(&mut cmd, Duration::from_secs(timeout_secs)) {
        Ok(output) => output,
        Err(ExecError::Timeout(secs)) => {
            return early_failure(
                name,
                &start_time,
                start.elapsed(),
                format!("Timeout after {secs}s"),
            );
        }
        Err(e) => {
            return early_failure(name, &start_time, start.elapsed(), format!("Error: {e}"));
        }
    };
    let duration = start.elapsed();

    let (passed, message) = match check_expectations(&unit.test, &unit.variables, &output) {
        Ok(()) => (true, "OK".to_string()),
        Err(message) => (false, message),
    };

    TestOutcome {
        name: name.clone(),
        passed,
        duration,
        start_time,
        message,
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_code,
    }
}

/// A failed outcome for a test that started but never produced output.
fn early_failure(name: &str, start_time: &str, duration: Duration, message: String) -> TestOutcome {
    TestOutcome {
        name: name.to_string(),
        passed: false,
        duration,
        start_time: start_time.to_string(),
        message,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: 0,
    }
}

/// Write the self-contained test script into the work directory.
fn write_script(
    work_dir: &Path,
    env_setup: &str,
    command: &str,
) -> std::io::Result<tempfile::NamedTempFile> {
    let mut script = tempfile::Builder::new()
        .prefix(".test_")
        .suffix(".sh")
        .tempfile_in(work_dir)?;

    writeln!(script, "#!/usr/bin/env bash")?;
    if !env_setup.is_empty() {
        writeln!(script, "{env_setup}")?;
    }
    writeln!(script, "{command}")?;
    script.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        script
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(script)
}

/// Evaluate the declared expectations, short-circuiting on the first
/// failure. The error value is the human-readable failure message.
fn check_expectations(
    test: &TestCase,
    variables: &BTreeMap<String, String>,
    output: &CapturedOutput,
) -> Result<(), String> {
    // Exit-code negation is checked first, then the exact expectation.
    // A lone negation suppresses the implicit "expect 0".
    if let Some(forbidden) = test.expected_exit_code_not
        && output.exit_code == forbidden
    {
        return Err(format!("Exit code should not be {forbidden}"));
    }
    let expected = match (test.expected_exit_code, test.expected_exit_code_not) {
        (Some(code), _) => Some(code),
        (None, None) => Some(0),
        (None, Some(_)) => None,
    };
    if let Some(expected) = expected
        && output.exit_code != expected
    {
        return Err(format!(
            "Expected exit code {expected}, got {}",
            output.exit_code
        ));
    }

    if let Some(expected) = &test.expected_output_contains {
        let combined = format!("{}{}", output.stdout, output.stderr);
        for needle in expected.as_slice() {
            if !needle.is_empty() && !combined.contains(needle.as_str()) {
                let preview: String = needle.chars().take(SUBSTRING_PREVIEW_LEN).collect();
                return Err(format!("Expected output not found: '{preview}...'"));
            }
        }
    }

    for validation in &test.validate {
        check_validation(validation, variables)?;
    }

    Ok(())
}

fn check_validation(
    validation: &Validation,
    variables: &BTreeMap<String, String>,
) -> Result<(), String> {
    match validation {
        Validation::OutputExists(path) => {
            let path = vars::substitute(path, variables);
            if !Path::new(&path).exists() {
                return Err(format!("Output file not found: {path}"));
            }
        }
        Validation::SameDimensions([first, second]) => {
            let first = vars::substitute(first, variables);
            let second = vars::substitute(second, variables);
            let shapes = (
                nifti::read_shape(Path::new(&first)),
                nifti::read_shape(Path::new(&second)),
            );
            match shapes {
                (Ok(a), Ok(b)) if a == b => {}
                (Ok(a), Ok(b)) => {
                    return Err(format!("Dimension mismatch: {a:?} vs {b:?}"));
                }
                (Err(e), _) | (_, Err(e)) => {
                    return Err(format!("Error comparing dimensions: {e}"));
                }
            }
        }
    }
    Ok(())
}
