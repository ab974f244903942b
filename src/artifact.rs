//! Backup artifacts on disk.
//!
//! # Layout
//!
//! ```text
//! <backup-root>/<environment>/<service>/<backup_type>/<service>_<backup_type>_<YYYYMMDD_HHMMSS>[.ext][.gz]
//! ```
//!
//! Timestamps are UTC with second resolution and are the source of truth for
//! an artifact's age; file modification times are never consulted.
//!
//! # Write Discipline
//!
//! Backends stream into a hidden `.<name>.partial` sibling. Only a successful
//! [`PendingArtifact::commit`] renames it onto the final path; dropping an
//! uncommitted pending artifact deletes the partial file, so a failed,
//! timed-out or cancelled backup never leaves a file at a final path.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::types::BackupType;

/// File-name timestamp format
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const PARTIAL_SUFFIX: &str = ".partial";

/// One backup output file and its metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub service: String,
    pub environment: String,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub compressed: bool,
}

impl BackupArtifact {
    /// Canonical file name for an artifact
    pub fn file_name(
        service: &str,
        backup_type: BackupType,
        created_at: DateTime<Utc>,
        compressed: bool,
    ) -> String {
        let mut name = format!(
            "{}_{}_{}.{}",
            service,
            backup_type,
            created_at.format(TIMESTAMP_FORMAT),
            backup_type.extension()
        );
        if compressed {
            name.push_str(".gz");
        }
        name
    }
}

/// Components recovered from an artifact file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub service: String,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    pub compressed: bool,
}

/// Parse `<service>_<type>_<YYYYMMDD_HHMMSS>[.ext][.gz]`.
///
/// Hidden files (partials, lock files) and anything else that does not
/// follow the naming scheme yield `None`.
pub fn parse_file_name(name: &str) -> Option<ParsedName> {
    if name.starts_with('.') {
        return None;
    }

    let (rest, compressed) = match name.strip_suffix(".gz") {
        Some(rest) => (rest, true),
        None => (name, false),
    };
    let (stem, extension) = match rest.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (rest, None),
    };

    let mut parts = stem.rsplitn(3, '_');
    let time = parts.next()?;
    let date = parts.next()?;
    let head = parts.next()?;
    let (service, backup_type) = head.split_once('_')?;
    let backup_type = BackupType::from_str(backup_type).ok()?;

    if let Some(ext) = extension {
        if ext != backup_type.extension() {
            return None;
        }
    }

    let created_at =
        NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), TIMESTAMP_FORMAT).ok()?;

    Some(ParsedName {
        service: service.to_string(),
        backup_type,
        created_at: created_at.and_utc(),
        compressed,
    })
}

/// Root of the artifact tree
pub struct ArtifactStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn service_dir(&self, environment: &str, service: &str) -> PathBuf {
        self.root.join(environment).join(service)
    }

    pub fn type_dir(&self, environment: &str, service: &str, backup_type: BackupType) -> PathBuf {
        self.service_dir(environment, service)
            .join(backup_type.to_string())
    }

    /// Reserve the next artifact path for (environment, service, type).
    ///
    /// Fails with `AlreadyExists` when an artifact with the same identity was
    /// already written within the same second.
    pub fn begin(
        &self,
        environment: &str,
        service: &str,
        backup_type: BackupType,
    ) -> io::Result<PendingArtifact> {
        let dir = self.type_dir(environment, service, backup_type);
        fs::create_dir_all(&dir)?;

        let created_at = self.clock.now();
        let name = BackupArtifact::file_name(service, backup_type, created_at, false);
        let final_path = dir.join(&name);
        let gz_path = dir.join(format!("{}.gz", name));
        if final_path.exists() || gz_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("artifact {} already exists", final_path.display()),
            ));
        }

        Ok(PendingArtifact {
            partial_path: dir.join(format!(".{}{}", name, PARTIAL_SUFFIX)),
            final_path,
            service: service.to_string(),
            environment: environment.to_string(),
            backup_type,
            created_at,
            committed: false,
        })
    }

    /// Gzip an artifact in place.
    ///
    /// On success the uncompressed file is gone and the returned artifact
    /// points at the `.gz` file. On failure nothing changes on disk and the
    /// caller keeps the original artifact.
    pub fn compress(&self, artifact: &BackupArtifact) -> io::Result<BackupArtifact> {
        if artifact.compressed {
            return Ok(artifact.clone());
        }

        let name = artifact
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact has no file name"))?;
        let gz_name = format!("{}.gz", name);
        let gz_path = artifact.path.with_file_name(&gz_name);
        let partial = artifact
            .path
            .with_file_name(format!(".{}{}", gz_name, PARTIAL_SUFFIX));

        let written: io::Result<()> = (|| {
            let mut input = File::open(&artifact.path)?;
            let output = File::create(&partial)?;
            let mut encoder = GzEncoder::new(output, Compression::default());
            io::copy(&mut input, &mut encoder)?;
            let output = encoder.finish()?;
            output.sync_all()?;
            fs::rename(&partial, &gz_path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        if let Err(e) = fs::remove_file(&artifact.path) {
            tracing::warn!(path = %artifact.path.display(), error = %e, "could not remove uncompressed artifact");
        }

        Ok(BackupArtifact {
            path: gz_path.clone(),
            size_bytes: fs::metadata(&gz_path)?.len(),
            compressed: true,
            ..artifact.clone()
        })
    }

    /// All artifacts of an environment, optionally limited to one service,
    /// ordered by service, type and creation time.
    pub fn list(&self, environment: &str, service: Option<&str>) -> io::Result<Vec<BackupArtifact>> {
        let env_dir = self.root.join(environment);
        let services: Vec<String> = match service {
            Some(s) => vec![s.to_string()],
            None => read_dir_names(&env_dir)?,
        };

        let mut artifacts = Vec::new();
        for service in services {
            for type_name in read_dir_names(&self.service_dir(environment, &service))? {
                let Ok(backup_type) = BackupType::from_str(&type_name) else {
                    continue;
                };
                artifacts.extend(self.list_type(environment, &service, backup_type)?);
            }
        }

        artifacts.sort_by(|a, b| {
            (&a.service, a.backup_type, a.created_at).cmp(&(&b.service, b.backup_type, b.created_at))
        });
        Ok(artifacts)
    }

    /// Artifacts in one (environment, service, type) directory
    pub fn list_type(
        &self,
        environment: &str,
        service: &str,
        backup_type: BackupType,
    ) -> io::Result<Vec<BackupArtifact>> {
        let dir = self.type_dir(environment, service, backup_type);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(parsed) = file_name.to_str().and_then(parse_file_name) else {
                continue;
            };
            if parsed.service != service || parsed.backup_type != backup_type {
                continue;
            }
            artifacts.push(BackupArtifact {
                service: parsed.service,
                environment: environment.to_string(),
                backup_type,
                created_at: parsed.created_at,
                path: entry.path(),
                size_bytes: entry.metadata()?.len(),
                compressed: parsed.compressed,
            });
        }
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    /// Delete leftover partial files of one service (from killed runs).
    ///
    /// Must only be called while holding the service lock, otherwise it
    /// could remove the partial file of a backup that is still running.
    pub fn discard_partials(&self, environment: &str, service: &str) -> io::Result<usize> {
        let mut discarded = 0;
        for type_name in read_dir_names(&self.service_dir(environment, service))? {
            let dir = self.service_dir(environment, service).join(type_name);
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) {
                    fs::remove_file(entry.path())?;
                    tracing::warn!(path = %entry.path().display(), "discarded partial artifact from an interrupted run");
                    discarded += 1;
                }
            }
        }
        Ok(discarded)
    }
}

/// Names of the sub-directories of `dir` (empty when `dir` is missing)
fn read_dir_names(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// An artifact being written.
///
/// Dropping it without calling [`commit`](Self::commit) removes the partial
/// file.
#[derive(Debug)]
pub struct PendingArtifact {
    partial_path: PathBuf,
    final_path: PathBuf,
    service: String,
    environment: String,
    backup_type: BackupType,
    created_at: DateTime<Utc>,
    committed: bool,
}

impl PendingArtifact {
    /// Where the backend should write
    pub fn path(&self) -> &Path {
        &self.partial_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Atomically publish the artifact under its final name
    pub fn commit(mut self) -> io::Result<BackupArtifact> {
        let size_bytes = fs::metadata(&self.partial_path)?.len();
        fs::rename(&self.partial_path, &self.final_path)?;
        self.committed = true;
        Ok(BackupArtifact {
            service: self.service.clone(),
            environment: self.environment.clone(),
            backup_type: self.backup_type,
            created_at: self.created_at,
            path: self.final_path.clone(),
            size_bytes,
            compressed: false,
        })
    }
}

impl Drop for PendingArtifact {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_file(&self.partial_path) {
            Ok(()) => tracing::info!(path = %self.partial_path.display(), "discarded partial artifact"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.partial_path.display(), error = %e, "could not discard partial artifact"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;
    use std::io::Read;

    fn store(dir: &Path) -> ArtifactStore {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 2, 0, 5).unwrap();
        ArtifactStore::new(dir, Arc::new(FixedClock::new(now)))
    }

    #[test]
    fn test_file_name_round_trip() {
        let created = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let name = BackupArtifact::file_name("cache-store", BackupType::AppendLog, created, true);
        assert_eq!(name, "cache-store_append-log_20260102_030405.tar.gz");

        let parsed = parse_file_name(&name).unwrap();
        assert_eq!(parsed.service, "cache-store");
        assert_eq!(parsed.backup_type, BackupType::AppendLog);
        assert_eq!(parsed.created_at, created);
        assert!(parsed.compressed);
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(parse_file_name(".relational-store_full_20260102_030405.sql.partial").is_none());
        assert!(parse_file_name("notes.txt").is_none());
        assert!(parse_file_name("relational-store_full_2026_030405.sql").is_none());
        assert!(parse_file_name("relational-store_full_20260102_030405.rdb").is_none());
        assert!(parse_file_name("relational-store_nightly_20260102_030405").is_none());
    }

    #[test]
    fn test_commit_publishes_final_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let pending = store.begin("production", "relational-store", BackupType::Full).unwrap();
        fs::write(pending.path(), b"-- dump").unwrap();
        assert!(!pending.final_path().exists());

        let artifact = pending.commit().unwrap();
        assert_eq!(
            artifact.path,
            dir.path()
                .join("production/relational-store/full/relational-store_full_20260314_020005.sql")
        );
        assert_eq!(artifact.size_bytes, 7);
        assert!(!artifact.compressed);
        assert_eq!(store.list("production", None).unwrap(), vec![artifact]);
    }

    #[test]
    fn test_dropped_pending_artifact_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let pending = store.begin("production", "relational-store", BackupType::Full).unwrap();
        fs::write(pending.path(), b"half a dump").unwrap();
        let partial = pending.path().to_path_buf();
        let final_path = pending.final_path().to_path_buf();
        drop(pending);

        assert!(!partial.exists());
        assert!(!final_path.exists());
        assert!(store.list("production", None).unwrap().is_empty());
    }

    #[test]
    fn test_same_second_collision_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let pending = store.begin("production", "cache-store", BackupType::Snapshot).unwrap();
        fs::write(pending.path(), b"rdb").unwrap();
        pending.commit().unwrap();

        let err = store.begin("production", "cache-store", BackupType::Snapshot).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_compress_replaces_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let pending = store.begin("staging", "relational-store", BackupType::Schema).unwrap();
        fs::write(pending.path(), "CREATE TABLE t (id int);\n".repeat(200)).unwrap();
        let artifact = pending.commit().unwrap();

        let compressed = store.compress(&artifact).unwrap();
        assert!(compressed.compressed);
        assert!(!artifact.path.exists());
        assert!(compressed.path.to_string_lossy().ends_with(".sql.gz"));
        assert!(compressed.size_bytes < artifact.size_bytes);

        let mut decoded = String::new();
        flate2::read::GzDecoder::new(File::open(&compressed.path).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert!(decoded.starts_with("CREATE TABLE"));

        let listed = store.list("staging", Some("relational-store")).unwrap();
        assert_eq!(listed, vec![compressed]);
    }

    #[test]
    fn test_compress_failure_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let missing = BackupArtifact {
            service: "relational-store".to_string(),
            environment: "staging".to_string(),
            backup_type: BackupType::Full,
            created_at: store.now(),
            path: dir.path().join("relational-store_full_20260314_020005.sql"),
            size_bytes: 0,
            compressed: false,
        };
        assert!(store.compress(&missing).is_err());
        assert!(!dir.path().join(".relational-store_full_20260314_020005.sql.gz.partial").exists());
    }

    #[test]
    fn test_discard_partials() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let type_dir = store.type_dir("production", "vector-store", BackupType::Collection);
        fs::create_dir_all(&type_dir).unwrap();
        fs::write(type_dir.join(".vector-store_collection_20260301_000000.tar.partial"), b"x").unwrap();
        fs::write(type_dir.join("vector-store_collection_20260301_000000.tar"), b"x").unwrap();

        assert_eq!(store.discard_partials("production", "vector-store").unwrap(), 1);
        assert_eq!(store.list("production", None).unwrap().len(), 1);
        assert_eq!(store.discard_partials("production", "missing").unwrap(), 0);
    }
}
