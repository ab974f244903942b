//! Model-serving cache (Ollama).

use super::listing::expire_files;
use super::{Adapter, Backend, Target, ensure_supported};
use crate::artifact::BackupArtifact;
use crate::commands::fs::{FindArgs, TarArgs};
use crate::config::ModelCacheConfig;
use crate::error::{BackupError, CleanupError};
use crate::retention::RetentionRun;
use crate::types::{BackendKind, BackupType};

const SUPPORTED: &[BackupType] = &[BackupType::Artifacts, BackupType::Config];
const DEFAULTS: &[BackupType] = &[BackupType::Artifacts];

pub struct ModelCacheAdapter {
    backend: Backend,
    config: ModelCacheConfig,
}

impl ModelCacheAdapter {
    pub fn new(backend: Backend, config: ModelCacheConfig) -> Self {
        Self { backend, config }
    }

    /// Config archive without the model tree when it lives inside it
    fn config_archive(&self) -> TarArgs {
        let config_dir = self.config.config_dir.trim_end_matches('/');
        let mut tar = TarArgs::directory(config_dir.to_string());
        for nested in [&self.config.models_dir, &self.config.cache_dir] {
            if let Some(rest) = nested.strip_prefix(config_dir).and_then(|r| r.strip_prefix('/')) {
                tar = tar.excluding(format!("./{}", rest.trim_end_matches('/')));
            }
        }
        tar
    }
}

impl Adapter for ModelCacheAdapter {
    fn service(&self) -> &str {
        self.backend.service()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ModelCache
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
            BackupType::Config => self.config_archive(),
            _ => TarArgs::directory(self.config.models_dir.clone()),
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
        let find = FindArgs::files(self.config.cache_dir.clone());
        expire_files(&self.backend, target, &find, age_threshold_days, dry_run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{ScriptedRuntime, backend};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter(runtime: Arc<ScriptedRuntime>, root: &std::path::Path) -> ModelCacheAdapter {
        let now = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        let (backend, _) = backend(runtime, root, now);
        ModelCacheAdapter::new(backend, ModelCacheConfig::default())
    }

    #[test]
    fn test_config_archive_excludes_models() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply("tar-bytes");
        let adapter = adapter(runtime.clone(), dir.path());

        adapter
            .backup(&Target::new("staging", Duration::from_secs(60)), BackupType::Config)
            .unwrap();
        assert_eq!(
            runtime.calls()[0],
            "tar -C /root/.ollama -cf - --exclude=./models --exclude=./cache ."
        );
    }

    #[test]
    fn test_cleanup_dry_run_does_not_remove() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply("1767225600.0\t/root/.ollama/cache/blob\n");
        let adapter = adapter(runtime.clone(), dir.path());

        let run = adapter
            .cleanup(&Target::new("staging", Duration::from_secs(60)), 7, true)
            .unwrap();
        assert_eq!(run.items_eligible, 1);
        assert_eq!(run.items_removed, 0);
        assert_eq!(runtime.calls().len(), 1);
    }
}
