//! Container image resolution and Apptainer invocation.
//!
//! Images are Apptainer/Singularity `.simg` files kept in a flat directory.
//! Commands never run the runtime themselves; they only build the
//! `std::process::Command` so the executor owns all process plumbing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;

/// The container runtime binary.
pub const RUNTIME: &str = "apptainer";

/// Seconds allowed for the pre-flight health probe.
pub const HEALTH_PROBE_TIMEOUT_SECS: u64 = 30;

/// The variable name excluded from bind-mount derivation: the output
/// directory always lives under the (already bound) work directory.
pub const OUTPUT_DIR_VAR: &str = "output_dir";

/// Locate a container image under `containers_dir`.
///
/// Tries an exact filename match first, then falls back to the newest
/// (lexicographically last) `{prefix}_*.simg`, where the prefix is the
/// reference with any `.simg` suffix stripped, up to the first `_`. Version
/// suffixes sort as strings, which matches how image files are named.
pub fn find_container(reference: &str, containers_dir: &Path) -> Option<PathBuf> {
    if reference.is_empty() || !containers_dir.is_dir() {
        return None;
    }

    let exact = containers_dir.join(reference);
    if exact.exists() {
        return Some(exact);
    }

    let base = reference.trim_end_matches(".simg");
    let base = base.split('_').next().unwrap_or(base);
    let prefix = format!("{base}_");

    let mut matches: Vec<PathBuf> = std::fs::read_dir(containers_dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".simg"))
        })
        .collect();
    matches.sort();
    matches.pop()
}

/// Bind specs (`host:container`) for one test: the work directory plus the
/// existing parent directory of every path-shaped variable value, except
/// the output directory. A `BTreeSet` keeps the argument order stable.
pub fn bind_mounts(work_dir: &Path, variables: &BTreeMap<String, String>) -> BTreeSet<String> {
    let mut binds = BTreeSet::new();
    binds.insert(format!("{0}:{0}", work_dir.display()));

    for (key, value) in variables {
        if key == OUTPUT_DIR_VAR || !value.contains('/') {
            continue;
        }
        if let Some(parent) = Path::new(value).parent()
            && parent.is_dir()
        {
            binds.insert(format!("{0}:{0}", parent.display()));
        }
    }

    binds
}

/// Build the `apptainer exec` invocation running `script` inside `image`.
pub fn exec_command(image: &Path, script: &Path, binds: &BTreeSet<String>) -> Command {
    let mut cmd = Command::new(RUNTIME);
    cmd.arg("exec").arg("--writable-tmpfs");
    for bind in binds {
        cmd.arg("-B").arg(bind);
    }
    cmd.arg(image).arg("bash").arg(script);
    cmd
}

/// Build the health-probe invocation: a no-op `true` inside `image`.
pub fn probe_command(image: &Path, work_dir: &Path) -> Command {
    let mut cmd = Command::new(RUNTIME);
    cmd.arg("exec").arg("--writable-tmpfs");
    cmd.arg("-B").arg(format!("{0}:{0}", work_dir.display()));
    cmd.arg(image).arg("true");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("niimath_1.0.0.simg"), b"").unwrap();
        std::fs::write(dir.path().join("niimath_2.0.0.simg"), b"").unwrap();

        let found = find_container("niimath_1.0.0.simg", dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "niimath_1.0.0.simg");
    }

    #[test]
    fn glob_falls_back_to_newest_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fsl_6.0.4.simg"), b"").unwrap();
        std::fs::write(dir.path().join("fsl_6.0.7.simg"), b"").unwrap();
        std::fs::write(dir.path().join("afni_24.0.simg"), b"").unwrap();

        let found = find_container("fsl.simg", dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "fsl_6.0.7.simg");

        let found = find_container("fsl_5.0.simg", dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "fsl_6.0.7.simg");
    }

    #[test]
    fn missing_container_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_container("ghost.simg", dir.path()).is_none());
        assert!(find_container("", dir.path()).is_none());
        assert!(find_container("x.simg", &dir.path().join("nonexistent")).is_none());
    }

    #[test]
    fn bind_mounts_cover_work_dir_and_path_variable_parents() {
        let work = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let input = data.path().join("T1.nii.gz");
        std::fs::write(&input, b"").unwrap();

        let mut vars = BTreeMap::new();
        vars.insert("input".to_string(), input.display().to_string());
        vars.insert("threads".to_string(), "4".to_string());
        vars.insert(
            OUTPUT_DIR_VAR.to_string(),
            work.path().join("out").display().to_string(),
        );

        let binds = bind_mounts(work.path(), &vars);

        let work_bind = format!("{0}:{0}", work.path().display());
        let data_bind = format!("{0}:{0}", data.path().display());
        assert!(binds.contains(&work_bind));
        assert!(binds.contains(&data_bind));
        // Scalars and the output directory contribute no binds.
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn missing_parent_directories_are_not_bound() {
        let work = tempfile::tempdir().unwrap();
        let mut vars = BTreeMap::new();
        vars.insert(
            "input".to_string(),
            "/nonexistent/path/file.nii".to_string(),
        );

        let binds = bind_mounts(work.path(), &vars);
        assert_eq!(binds.len(), 1);
    }

    #[test]
    fn exec_command_shape() {
        let binds: BTreeSet<String> = ["/work:/work".to_string()].into_iter().collect();
        let cmd = exec_command(
            Path::new("/imgs/tool_1.simg"),
            Path::new("/work/.test_1.sh"),
            &binds,
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(cmd.get_program(), RUNTIME);
        assert_eq!(
            args,
            [
                "exec",
                "--writable-tmpfs",
                "-B",
                "/work:/work",
                "/imgs/tool_1.simg",
                "bash",
                "/work/.test_1.sh"
            ]
        );
    }
}
