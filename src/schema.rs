//! Schema definitions for sifter suite files.
//!
//! A suite file binds an ordered list of tests to one container image.
//! Suites are written in YAML (or TOML) and validated against these types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fallback timeout when neither a test nor its suite declares one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Root document for a suite file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SuiteDefinition {
    /// Suite name. Defaults to the file stem when omitted.
    #[serde(default)]
    pub name: Option<String>,

    /// Container image reference. When absent or empty, tests run directly
    /// on the host with no container resolution and no health probe.
    #[serde(default)]
    pub container: Option<String>,

    /// Default timeout in seconds for tests in this suite.
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,

    /// Named test-data variables, referenced as `${name}` or `$name` in
    /// commands, env setup, and validation paths. Values containing a path
    /// separator are anchored under the work directory unless absolute.
    #[serde(default)]
    pub test_data: BTreeMap<String, String>,

    /// Environment setup inserted before every test command.
    #[serde(default)]
    pub env_setup: Option<String>,

    /// Setup script run once before the suite. A non-zero exit abandons the
    /// suite without attempting any test.
    #[serde(default)]
    pub setup: Option<ScriptBlock>,

    /// Cleanup script run once after the suite, best-effort.
    #[serde(default)]
    pub cleanup: Option<ScriptBlock>,

    /// The tests, in declaration order.
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

/// A named shell snippet (`setup:` / `cleanup:` blocks).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ScriptBlock {
    #[serde(default)]
    pub script: String,
}

/// A single declared test.
///
/// Names need not be unique; duplicates are legal and tracked independently.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TestCase {
    /// Test name, used in reporting and filtering.
    pub name: String,

    /// Command template. Empty commands fail without executing anything.
    #[serde(default)]
    pub command: String,

    /// Per-test environment setup, overriding the suite-level `env_setup`.
    #[serde(default)]
    pub env_setup: Option<String>,

    /// Per-test timeout in seconds, overriding `default_timeout`.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Expected exit code. Defaults to 0 when no negation is declared.
    #[serde(default)]
    pub expected_exit_code: Option<i32>,

    /// Forbidden exit code, checked before `expected_exit_code`.
    #[serde(default)]
    pub expected_exit_code_not: Option<i32>,

    /// Substrings the combined stdout+stderr must contain.
    #[serde(default)]
    pub expected_output_contains: Option<StringOrList>,

    /// Filesystem validations evaluated in order after output checks.
    #[serde(default)]
    pub validate: Vec<Validation>,
}

/// One string or a list of strings; suite authors may write either.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn as_slice(&self) -> &[String] {
        match self {
            StringOrList::One(s) => std::slice::from_ref(s),
            StringOrList::Many(v) => v,
        }
    }
}

/// A validation directive: a single-key map whose key names the check.
///
/// Parsed into a tagged variant at suite-load time so downstream code gets
/// exhaustive matching instead of string-keyed branching.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    /// The substituted path must exist after the command runs.
    OutputExists(String),
    /// Both paths must load as NIfTI volumes with identical dimensions.
    SameDimensions([String; 2]),
}

/// Generate the JSON Schema for suite files.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(SuiteDefinition)
}
