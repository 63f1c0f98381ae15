//! Suite file loader.
//!
//! Discovers and parses suite definition files from disk.

use crate::schema::SuiteDefinition;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for suite loading operations.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported file format: {0} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat(String),
}

/// A parsed suite definition bound to the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedSuite {
    pub path: PathBuf,
    pub definition: SuiteDefinition,
}

impl LoadedSuite {
    /// The suite's reporting name: the declared `name`, else the file stem.
    pub fn name(&self) -> String {
        self.definition
            .name
            .clone()
            .unwrap_or_else(|| suite_name_for_path(&self.path))
    }
}

/// The fallback suite name derived from a file path.
pub fn suite_name_for_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Load a suite definition from a file path.
pub fn load_suite(path: &Path) -> Result<LoadedSuite, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path)?;

    let definition = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents)?,
        "toml" => toml::from_str(&contents)?,
        other => return Err(LoadError::UnsupportedFormat(other.to_string())),
    };

    Ok(LoadedSuite {
        path: path.to_path_buf(),
        definition,
    })
}

/// Find all suite files in a directory, or return the single file.
pub fn find_suites(path: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut suites = Vec::new();
    collect_suites_recursive(path, &mut suites)?;
    suites.sort();
    Ok(suites)
}

fn collect_suites_recursive(dir: &Path, suites: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            collect_suites_recursive(&path, suites)?;
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && (ext == "yaml" || ext == "yml" || ext == "toml")
        {
            suites.push(path);
        }
    }
    Ok(())
}

/// Resolve the suite arguments given on the command line: each argument is a
/// path as given, or a file name under the tests directory.
pub fn resolve_suite_args(args: &[String], tests_dir: &Path) -> Result<Vec<PathBuf>, String> {
    let mut paths = Vec::new();
    for arg in args {
        let direct = PathBuf::from(arg);
        if direct.is_file() {
            paths.push(direct);
            continue;
        }
        let under_tests = tests_dir.join(arg);
        if under_tests.is_file() {
            paths.push(under_tests);
            continue;
        }
        return Err(format!("suite file not found: {arg}"));
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}
