//! Append-only JSON-lines record of runs and notifications.
//!
//! Each line is one self-contained [`EventRecord`]. Lines are only ever
//! appended, so concurrent invocations for different environments never
//! rewrite each other's history. Unreadable lines are skipped when reading
//! back.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::BackupArtifact;
use crate::executor::BackupReport;
use crate::notify::NotificationEvent;
use crate::retention::{CleanupReport, RetentionRun};
use crate::types::OperationKind;

/// Outcome of one backup or cleanup invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub kind: OperationKind,
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<BackupArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retention: Vec<RetentionRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl RunRecord {
    pub fn from_backup(report: &BackupReport, service: Option<&str>) -> Self {
        Self {
            kind: OperationKind::Backup,
            environment: report.environment.clone(),
            service: service.map(String::from),
            started_at: report.started_at,
            finished_at: report.finished_at,
            succeeded: report.succeeded(),
            failed: report.failed(),
            cancelled: report.cancelled,
            artifacts: report.artifacts().cloned().collect(),
            retention: report
                .results
                .iter()
                .filter_map(|r| r.pruned.clone())
                .collect(),
            errors: report
                .results
                .iter()
                .filter_map(|r| r.outcome.as_ref().err())
                .map(ToString::to_string)
                .collect(),
        }
    }

    pub fn from_cleanup(report: &CleanupReport, service: Option<&str>) -> Self {
        Self {
            kind: OperationKind::Cleanup,
            environment: report.environment.clone(),
            service: service.map(String::from),
            started_at: report.started_at,
            finished_at: report.finished_at,
            succeeded: report.succeeded(),
            failed: report.failed(),
            cancelled: report.cancelled,
            artifacts: Vec::new(),
            retention: report.runs().cloned().collect(),
            errors: report
                .results
                .iter()
                .filter_map(|r| r.outcome.as_ref().err())
                .map(ToString::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventRecord {
    Run(RunRecord),
    Notification(NotificationEvent),
}

impl EventRecord {
    pub fn environment(&self) -> &str {
        match self {
            Self::Run(run) => &run.environment,
            Self::Notification(event) => &event.environment,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Run(run) => format!(
                "{} {} {}{}: {} succeeded, {} failed{}",
                run.finished_at.format("%Y-%m-%d %H:%M:%S"),
                run.kind,
                run.environment,
                run.service.as_deref().map(|s| format!("/{}", s)).unwrap_or_default(),
                run.succeeded,
                run.failed,
                if run.cancelled { " (cancelled)" } else { "" }
            ),
            Self::Notification(event) => format!(
                "{} notify {} {}: {}/{} channels delivered",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.environment,
                event.severity,
                event.channels_succeeded.len(),
                event.channels_attempted.len()
            ),
        }
    }
}

pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line
    pub fn append(&self, record: &EventRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(record).map_err(io::Error::other)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }

    /// The last `limit` records, oldest first, optionally for one environment
    pub fn read_recent(&self, limit: usize, environment: Option<&str>) -> io::Result<Vec<EventRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(&line) {
                Ok(record) if environment.is_none_or(|env| record.environment() == env) => {
                    records.push(record)
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), line = index + 1, error = %e, "skipping unreadable event log line")
                }
            }
        }

        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}
