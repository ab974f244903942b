//! Pre-flight sanity checks
//!
//! Verified before any backend is touched:
//! - The container runtime binary (and `crontab` for schedule changes) is
//!   on `PATH`
//! - The backup root exists or can be created, and is writable
//!
//! A failed check aborts the invocation with exit code 1 and a message
//! listing every problem found.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Result of environment verification
#[derive(Debug, Default)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    /// Why the backup root is unusable, if it is
    pub backup_root_problem: Option<String>,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.backup_root_problem.is_none()
    }

    pub fn problems(&self) -> Vec<String> {
        let mut problems: Vec<String> = self
            .missing_binaries
            .iter()
            .map(|b| format!("required binary '{}' not found on PATH", b))
            .collect();
        if let Some(problem) = &self.backup_root_problem {
            problems.push(problem.clone());
        }
        problems
    }
}

/// Locate an executable the way the shell would
pub fn find_binary(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Create the backup root if needed and prove it accepts new files
fn check_writable(root: &Path) -> Result<(), String> {
    fs::create_dir_all(root).map_err(|e| format!("backup root {} cannot be created: {}", root.display(), e))?;
    let probe = root.join(format!(".stackkeeper-probe-{}", std::process::id()));
    fs::write(&probe, b"")
        .map_err(|e| format!("backup root {} is not writable: {}", root.display(), e))?;
    // Best effort: a stale probe file is harmless
    let _ = fs::remove_file(&probe);
    Ok(())
}

/// Perform all sanity checks and return the result
pub fn verify_environment(binaries: &[&str], backup_root: Option<&Path>) -> SanityCheckResult {
    let mut result = SanityCheckResult::default();

    for binary in binaries {
        match find_binary(binary) {
            Some(path) => tracing::debug!(binary, path = %path.display(), "found required binary"),
            None => result.missing_binaries.push((*binary).to_string()),
        }
    }

    if let Some(root) = backup_root {
        if let Err(problem) = check_writable(root) {
            result.backup_root_problem = Some(problem);
        }
    }

    result
}
