//! Object store (MinIO), backed up at the filesystem level.

use super::listing::expire_files;
use super::{Adapter, Backend, Target, ensure_supported};
use crate::artifact::BackupArtifact;
use crate::commands::fs::{FindArgs, TarArgs};
use crate::config::ObjectConfig;
use crate::error::{BackupError, CleanupError};
use crate::retention::RetentionRun;
use crate::types::{BackendKind, BackupType};

const SUPPORTED: &[BackupType] = &[BackupType::Bucket, BackupType::Config];
const DEFAULTS: &[BackupType] = &[BackupType::Bucket, BackupType::Config];

/// Server-internal metadata tree inside the data directory
const SYSTEM_METADATA: &str = ".minio.sys";

pub struct ObjectAdapter {
    backend: Backend,
    config: ObjectConfig,
}

impl ObjectAdapter {
    pub fn new(backend: Backend, config: ObjectConfig) -> Self {
        Self { backend, config }
    }

    /// Files below `<data>/<bucket>/<prefix>/`
    fn ephemeral_files(&self) -> FindArgs {
        let root = self.config.data_dir.trim_end_matches('/').to_string();
        FindArgs {
            path_patterns: self
                .config
                .ephemeral_prefixes
                .iter()
                .map(|prefix| format!("{}/*/{}/*", root, prefix))
                .collect(),
            min_depth: Some(2),
            root,
        }
    }
}

impl Adapter for ObjectAdapter {
    fn service(&self) -> &str {
        self.backend.service()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Object
    }

    fn supported_backup_types(&self) -> &'static [BackupType] {
        SUPPORTED
    }

    fn default_backup_types(&self) -> &'static [BackupType] {
        DEFAULTS
    }

    fn backup(&self, target: &Target<'_>, backup_type: BackupType) -> Result<BackupArtifact, BackupError> {
        ensure_supported(self, backup_type)?;
        self.backend.backup_probe(target)?;
        let tar = match backup_type {
            BackupType::Config => TarArgs::directory(self.config.config_dir.clone()),
            _ => TarArgs::directory(self.config.data_dir.clone())
                .excluding(format!("./{}", SYSTEM_METADATA)),
        };
        self.backend.stream_artifact(target, backup_type, &tar)
    }

    fn cleanup(
        &self,
        target: &Target<'_>,
        age_threshold_days: u32,
        dry_run: bool,
    ) -> Result<RetentionRun, CleanupError> {
        self.backend.cleanup_probe(target)?;
        if self.config.ephemeral_prefixes.is_empty() {
            return Ok(self.backend.retention_run(target, age_threshold_days, dry_run));
        }
        expire_files(&self.backend, target, &self.ephemeral_files(), age_threshold_days, dry_run)
    }
}
