//! File expiry for backends whose ephemeral data is plain files.

use chrono::{DateTime, Utc};

use super::{Backend, Target};
use crate::commands::fs::{FindArgs, RemoveArgs};
use crate::error::{CleanupError, RuntimeError};
use crate::retention::{RetentionRun, is_expired};

/// Files per `rm` invocation
const REMOVE_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub modified: DateTime<Utc>,
}

/// Parse `find -printf '%T@\t%p\n'` output
pub fn parse_find_output(stdout: &str) -> Result<Vec<RemoteFile>, String> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (mtime, path) = line
                .split_once('\t')
                .ok_or_else(|| format!("malformed find output line '{}'", line))?;
            let secs: f64 = mtime
                .parse()
                .ok()
                .filter(|secs: &f64| secs.is_finite())
                .ok_or_else(|| format!("malformed modification time '{}'", mtime))?;
            let modified = DateTime::from_timestamp(secs.trunc() as i64, 0)
                .ok_or_else(|| format!("modification time out of range '{}'", mtime))?;
            Ok(RemoteFile {
                path: path.to_string(),
                modified,
            })
        })
        .collect()
}

/// List files with `find`, remove those strictly older than `days`.
///
/// A missing root directory means there is nothing to expire.
pub fn expire_files(
    backend: &Backend,
    target: &Target<'_>,
    find: &FindArgs,
    days: u32,
    dry_run: bool,
) -> Result<RetentionRun, CleanupError> {
    let service = backend.service();
    let mut run = backend.retention_run(target, days, dry_run);

    let output = match backend.exec(target, find) {
        Ok(output) => output.stdout,
        Err(RuntimeError::Failed { stderr, .. }) if stderr.contains("No such file or directory") => {
            tracing::debug!(service, root = %find.root, "nothing to expire, directory does not exist");
            return Ok(run);
        }
        Err(e) => return Err(CleanupError::from_runtime(service, e)),
    };

    let files = parse_find_output(&output).map_err(|reason| CleanupError::failed(service, reason))?;
    let now = run.executed_at;
    let expired: Vec<String> = files
        .iter()
        .filter(|f| is_expired(f.modified, now, days))
        .map(|f| f.path.clone())
        .collect();

    run.items_evaluated = files.len() as u64;
    run.items_eligible = expired.len() as u64;

    if dry_run {
        for path in &expired {
            tracing::info!(service, path = %path, "[DRY RUN] would remove expired file");
        }
        return Ok(run);
    }

    for batch in expired.chunks(REMOVE_BATCH) {
        let rm = RemoveArgs {
            paths: batch.to_vec(),
        };
        backend.cleanup_exec(target, &rm)?;
        run.items_removed += batch.len() as u64;
    }
    Ok(run)
}
