//! Suite preparation: container resolution, variable materialization, setup
//! execution, and the pre-flight health probe.
//!
//! Preparation either yields a list of self-contained [`PreparedTestUnit`]s
//! or abandons the suite with enough context to synthesize one outcome per
//! declared test, so the result stream never silently loses a test.

use crate::container;
use crate::executor;
use crate::loader::LoadedSuite;
use crate::outcome::TestOutcome;
use crate::schema::{DEFAULT_TIMEOUT_SECS, TestCase};
use crate::vars;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// An immutable bundle carrying everything one test needs to run in
/// isolation. Cloned per test; once dispatched to a worker it shares no
/// mutable state with the suite it came from.
#[derive(Debug, Clone)]
pub struct PreparedTestUnit {
    pub suite_name: String,
    pub container_name: String,
    /// Resolved image path; `None` runs the test directly on the host.
    pub container_path: Option<PathBuf>,
    pub test: TestCase,
    pub variables: BTreeMap<String, String>,
    pub work_dir: PathBuf,
    /// Suite-level env setup; the test's own `env_setup` overrides it.
    pub env_setup: Option<String>,
    pub default_timeout: u64,
}

/// A suite that survived preparation.
#[derive(Debug)]
pub struct PreparedSuite {
    pub name: String,
    pub container_name: String,
    pub units: Vec<PreparedTestUnit>,
    /// Cleanup script, variables already substituted. Best-effort.
    pub cleanup: Option<String>,
    pub work_dir: PathBuf,
}

/// Why a suite was abandoned before any test could run.
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Setup failed: {0}")]
    SetupFailed(String),
    #[error("Container health check failed: {0}")]
    HealthCheckFailed(String),
}

impl PrepareError {
    /// Name of the synthetic lead outcome recorded for this failure.
    fn outcome_name(&self) -> &'static str {
        match self {
            PrepareError::ContainerNotFound(_) => "Container lookup",
            PrepareError::SetupFailed(_) => "Setup",
            PrepareError::HealthCheckFailed(_) => "Container health check",
        }
    }

    /// Shared message stamped on every skipped test of the suite.
    fn skip_message(&self) -> &'static str {
        match self {
            PrepareError::ContainerNotFound(_) => "Skipped: container not found",
            PrepareError::SetupFailed(_) => "Skipped: suite setup failed",
            PrepareError::HealthCheckFailed(_) => "Skipped: container health check failed",
        }
    }
}

/// A suite abandoned during preparation, with the post-filter test names
/// that must still be accounted for in the result stream.
#[derive(Debug)]
pub struct AbandonedSuite {
    pub name: String,
    pub container_name: String,
    pub error: PrepareError,
    pub skipped_tests: Vec<String>,
}

impl AbandonedSuite {
    /// One lead outcome naming the cause, then one zero-duration failed
    /// outcome per declared test. No test command is ever invoked.
    pub fn outcomes(&self) -> Vec<TestOutcome> {
        let mut outcomes = Vec::with_capacity(self.skipped_tests.len() + 1);
        outcomes.push(TestOutcome::failed(
            self.error.outcome_name(),
            self.error.to_string(),
        ));
        for test in &self.skipped_tests {
            outcomes.push(TestOutcome::failed(test, self.error.skip_message()));
        }
        outcomes
    }
}

/// Prepare one loaded suite for execution.
pub fn prepare_suite(
    suite: &LoadedSuite,
    containers_dir: &Path,
    work_dir: &Path,
    filter: Option<&Regex>,
) -> Result<PreparedSuite, Box<AbandonedSuite>> {
    let name = suite.name();
    let def = &suite.definition;
    let container_name = def.container.clone().unwrap_or_default();

    let filtered: Vec<TestCase> = def
        .tests
        .iter()
        .filter(|test| filter.is_none_or(|re| re.is_match(&test.name)))
        .cloned()
        .collect();
    let test_names: Vec<String> = filtered.iter().map(|t| t.name.clone()).collect();
    let abandon = |error: PrepareError| {
        Box::new(AbandonedSuite {
            name: name.clone(),
            container_name: container_name.clone(),
            error,
            skipped_tests: test_names.clone(),
        })
    };

    // Host mode (no container reference) skips resolution and the probe.
    let container_path = if container_name.is_empty() {
        None
    } else {
        match container::find_container(&container_name, containers_dir) {
            Some(path) => Some(path),
            None => {
                return Err(abandon(PrepareError::ContainerNotFound(
                    container_name.clone(),
                )));
            }
        }
    };

    let variables = resolve_variables(&def.test_data, work_dir);

    if let Some(output_dir) = variables.get(container::OUTPUT_DIR_VAR)
        && let Err(e) = reset_output_dir(Path::new(output_dir))
    {
        return Err(abandon(PrepareError::SetupFailed(format!(
            "failed to reset output directory {output_dir}: {e}"
        ))));
    }

    if let Some(setup) = &def.setup
        && !setup.script.is_empty()
    {
        let script = vars::substitute(&setup.script, &variables);
        if let Err(message) = run_script(&script, work_dir, def.default_timeout) {
            return Err(abandon(PrepareError::SetupFailed(message)));
        }
    }

    if let Some(image) = &container_path
        && let Err(message) = health_probe(image, work_dir)
    {
        return Err(abandon(PrepareError::HealthCheckFailed(message)));
    }

    debug!(suite = %name, tests = filtered.len(), "suite prepared");

    let units = filtered
        .into_iter()
        .map(|test| PreparedTestUnit {
            suite_name: name.clone(),
            container_name: container_name.clone(),
            container_path: container_path.clone(),
            test,
            variables: variables.clone(),
            work_dir: work_dir.to_path_buf(),
            env_setup: def.env_setup.clone(),
            default_timeout: def.default_timeout,
        })
        .collect();

    let cleanup = def
        .cleanup
        .as_ref()
        .filter(|block| !block.script.is_empty())
        .map(|block| vars::substitute(&block.script, &variables));

    Ok(PreparedSuite {
        name,
        container_name,
        units,
        cleanup,
        work_dir: work_dir.to_path_buf(),
    })
}

/// Resolve test-data variables against the work directory.
///
/// `output_dir` is always anchored under the work directory. Other values
/// are anchored only when they look path-shaped (contain a separator) and
/// are not already absolute; scalars pass through untouched.
pub fn resolve_variables(
    test_data: &BTreeMap<String, String>,
    work_dir: &Path,
) -> BTreeMap<String, String> {
    let mut variables = BTreeMap::new();
    for (key, value) in test_data {
        let resolved = if key == container::OUTPUT_DIR_VAR {
            work_dir.join(value).display().to_string()
        } else if value.contains('/') && !Path::new(value).is_absolute() {
            work_dir.join(value).display().to_string()
        } else {
            value.clone()
        };
        variables.insert(key.clone(), resolved);
    }
    variables
}

/// Delete and recreate the suite's output directory so runs never share
/// stale outputs.
fn reset_output_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)
}

/// Run the best-effort cleanup script; failures are logged and swallowed.
pub fn run_cleanup(suite: &PreparedSuite) {
    let Some(script) = &suite.cleanup else {
        return;
    };
    if let Err(message) = run_script(script, &suite.work_dir, DEFAULT_TIMEOUT_SECS) {
        warn!(suite = %suite.name, %message, "cleanup script failed");
    }
}

/// Run a shell snippet synchronously in the work directory.
fn run_script(script: &str, work_dir: &Path, timeout_secs: u64) -> Result<(), String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(work_dir);

    match executor::run_with_timeout(&mut cmd, Duration::from_secs(timeout_secs)) {
        Ok(output) if output.exit_code == 0 => Ok(()),
        Ok(output) => {
            let stderr = output.stderr.trim();
            if stderr.is_empty() {
                Err(format!("exit code {}", output.exit_code))
            } else {
                Err(stderr.to_string())
            }
        }
        Err(e) => Err(e.to_string()),
    }
}

/// Probe the container with a trivial command before committing to the
/// suite, bounded by a short fixed timeout.
fn health_probe(image: &Path, work_dir: &Path) -> Result<(), String> {
    let mut cmd = container::probe_command(image, work_dir);
    cmd.current_dir(work_dir);

    match executor::run_with_timeout(
        &mut cmd,
        Duration::from_secs(container::HEALTH_PROBE_TIMEOUT_SECS),
    ) {
        Ok(output) if output.exit_code == 0 => Ok(()),
        Ok(output) => {
            let detail: String = output.stderr.chars().take(500).collect();
            Err(format!(
                "container cannot execute commands (exit {}): {detail}",
                output.exit_code
            ))
        }
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader;

    fn write_suite(dir: &Path, file: &str, contents: &str) -> LoadedSuite {
        let path = dir.join(file);
        std::fs::write(&path, contents).unwrap();
        loader::load_suite(&path).unwrap()
    }

    #[test]
    fn host_mode_suite_prepares_units() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let suite = write_suite(
            dir.path(),
            "host.yaml",
            r#"
tests:
  - name: one
    command: "true"
  - name: two
    command: "true"
"#,
        );

        let prepared = prepare_suite(&suite, dir.path(), work.path(), None).unwrap();
        assert_eq!(prepared.name, "host");
        assert_eq!(prepared.units.len(), 2);
        assert!(prepared.units[0].container_path.is_none());
        assert_eq!(prepared.units[1].test.name, "two");
    }

    #[test]
    fn filter_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let suite = write_suite(
            dir.path(),
            "host.yaml",
            r#"
tests:
  - name: Smooth volume
    command: "true"
  - name: threshold
    command: "true"
"#,
        );

        let filter = regex::RegexBuilder::new("smooth")
            .case_insensitive(true)
            .build()
            .unwrap();
        let prepared = prepare_suite(&suite, dir.path(), work.path(), Some(&filter)).unwrap();
        assert_eq!(prepared.units.len(), 1);
        assert_eq!(prepared.units[0].test.name, "Smooth volume");
    }

    #[test]
    fn output_dir_is_reset_before_the_suite() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let stale = work.path().join("out/stale.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"old").unwrap();

        let suite = write_suite(
            dir.path(),
            "host.yaml",
            r#"
test_data:
  output_dir: out
tests:
  - name: noop
    command: "true"
"#,
        );

        let prepared = prepare_suite(&suite, dir.path(), work.path(), None).unwrap();
        assert!(!stale.exists());
        assert!(work.path().join("out").is_dir());
        assert_eq!(
            prepared.units[0].variables.get("output_dir").unwrap(),
            &work.path().join("out").display().to_string()
        );
    }

    #[test]
    fn setup_failure_abandons_with_skips() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let suite = write_suite(
            dir.path(),
            "broken.yaml",
            r#"
setup:
  script: "echo nope >&2; exit 1"
tests:
  - name: never runs
    command: "true"
"#,
        );

        let abandoned = prepare_suite(&suite, dir.path(), work.path(), None).unwrap_err();
        assert!(matches!(abandoned.error, PrepareError::SetupFailed(_)));
        assert_eq!(abandoned.skipped_tests, vec!["never runs".to_string()]);

        let outcomes = abandoned.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].name, "Setup");
        assert!(outcomes[0].message.contains("nope"));
        assert_eq!(outcomes[1].name, "never runs");
        assert_eq!(outcomes[1].message, "Skipped: suite setup failed");
        assert_eq!(outcomes[1].duration, Duration::ZERO);
    }

    #[test]
    fn missing_container_abandons_suite() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let suite = write_suite(
            dir.path(),
            "imgless.yaml",
            r#"
container: ghost_1.0.simg
tests:
  - name: a
    command: "true"
  - name: b
    command: "true"
"#,
        );

        let abandoned = prepare_suite(&suite, dir.path(), work.path(), None).unwrap_err();
        assert!(matches!(abandoned.error, PrepareError::ContainerNotFound(_)));

        let outcomes = abandoned.outcomes();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].name, "Container lookup");
        assert!(outcomes[0].message.contains("ghost_1.0.simg"));
        assert!(outcomes.iter().skip(1).all(|o| o.is_skip()));
    }

    #[test]
    fn failing_probe_skips_every_filtered_test() {
        // A resolvable image plus a missing runtime makes the probe fail,
        // which is indistinguishable from a broken container here.
        let containers = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::write(containers.path().join("tool_1.0.simg"), b"not an image").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let suite = write_suite(
            dir.path(),
            "tool.yaml",
            r#"
container: tool_1.0.simg
tests:
  - name: first
    command: "true"
  - name: second
    command: "true"
"#,
        );

        let abandoned = prepare_suite(&suite, containers.path(), work.path(), None).unwrap_err();
        assert!(matches!(abandoned.error, PrepareError::HealthCheckFailed(_)));

        let outcomes = abandoned.outcomes();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].name, "Container health check");
        assert!(!outcomes[0].passed);
        for skip in &outcomes[1..] {
            assert!(!skip.passed);
            assert_eq!(skip.message, "Skipped: container health check failed");
            assert_eq!(skip.duration, Duration::ZERO);
        }
    }

    #[test]
    fn resolve_variables_anchors_paths_only() {
        let work = tempfile::tempdir().unwrap();
        let mut test_data = BTreeMap::new();
        test_data.insert("input".to_string(), "data/T1.nii".to_string());
        test_data.insert("absolute".to_string(), "/opt/data/T2.nii".to_string());
        test_data.insert("threads".to_string(), "4".to_string());
        test_data.insert("output_dir".to_string(), "out".to_string());

        let vars = resolve_variables(&test_data, work.path());
        assert_eq!(
            vars["input"],
            work.path().join("data/T1.nii").display().to_string()
        );
        assert_eq!(vars["absolute"], "/opt/data/T2.nii");
        assert_eq!(vars["threads"], "4");
        assert_eq!(vars["output_dir"], work.path().join("out").display().to_string());
    }

    #[test]
    fn cleanup_failure_is_swallowed() {
        let work = tempfile::tempdir().unwrap();
        let suite = PreparedSuite {
            name: "c".to_string(),
            container_name: String::new(),
            units: vec![],
            cleanup: Some("exit 1".to_string()),
            work_dir: work.path().to_path_buf(),
        };
        // Must not panic or propagate.
        run_cleanup(&suite);
    }
}
