//! Vector store (Qdrant), driven through its local HTTP API.
//!
//! `collection` asks the server to snapshot every collection and archives
//! the snapshot directory; `config` archives the configuration directory.
//!
//! Cleanup drops collections named `<stale prefix>..._YYYYMMDD` whose date
//! stamp is strictly older than the threshold. Stale-prefixed collections
//! without a stamp have no age and are kept.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use super::{Adapter, Backend, Target, ensure_supported};
use crate::artifact::BackupArtifact;
use crate::commands::fs::TarArgs;
use crate::commands::http::{CurlArgs, HttpMethod};
use crate::config::VectorConfig;
use crate::error::{BackupError, CleanupError};
use crate::retention::{RetentionRun, is_expired};
use crate::types::{BackendKind, BackupType};

const SUPPORTED: &[BackupType] = &[BackupType::Collection, BackupType::Config];
const DEFAULTS: &[BackupType] = &[BackupType::Collection, BackupType::Config];

#[derive(Debug, Deserialize)]
struct CollectionsResponse {
    result: CollectionsResult,
}

#[derive(Debug, Deserialize)]
struct CollectionsResult {
    collections: Vec<CollectionDescription>,
}

#[derive(Debug, Deserialize)]
struct CollectionDescription {
    name: String,
}

/// Names that are safe to place in a URL path
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Midnight UTC of a trailing `_YYYYMMDD` stamp
pub fn date_stamp(name: &str) -> Option<DateTime<Utc>> {
    let (_, stamp) = name.rsplit_once('_')?;
    if stamp.len() != 8 || !stamp.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let date = NaiveDate::parse_from_str(stamp, "%Y%m%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

pub struct VectorAdapter {
    backend: Backend,
    config: VectorConfig,
}

impl VectorAdapter {
    pub fn new(backend: Backend, config: VectorConfig) -> Self {
        Self { backend, config }
    }

    fn api(&self, method: HttpMethod, path: &str) -> CurlArgs {
        CurlArgs::new(method, &self.config.api_url, path)
    }

    fn parse_collections(&self, body: &str) -> Result<Vec<String>, String> {
        let response: CollectionsResponse =
            serde_json::from_str(body).map_err(|e| format!("unexpected collections reply: {}", e))?;
        Ok(response.result.collections.into_iter().map(|c| c.name).collect())
    }

    fn collection_backup(&self, target: &Target<'_>) -> Result<BackupArtifact, BackupError> {
        let body = self
            .backend
            .backup_exec(target, &self.api(HttpMethod::Get, "collections"))?
            .stdout;
        let collections = self
            .parse_collections(&body)
            .map_err(|reason| BackupError::command(self.service(), reason))?;

        for name in &collections {
            if !is_plain_name(name) {
                tracing::warn!(service = self.service(), collection = %name, "collection name not addressable, skipping snapshot");
                continue;
            }
            self.backend.backup_exec(
                target,
                &self.api(HttpMethod::Post, &format!("collections/{}/snapshots", name)),
            )?;
            tracing::debug!(service = self.service(), collection = %name, "snapshot created");
        }

        let tar = TarArgs::directory(self.config.snapshots_dir.clone());
        self.backend.stream_artifact(target, BackupType::Collection, &tar)
    }
}

impl Adapter for VectorAdapter {
    fn service(&self) -> &str {
        self.backend.service()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Vector
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
        match backup_type {
            BackupType::Config => {
                let tar = TarArgs::directory(self.config.config_dir.clone());
                self.backend.stream_artifact(target, BackupType::Config, &tar)
            }
            _ => self.collection_backup(target),
        }
    }

    fn cleanup(
        &self,
        target: &Target<'_>,
        age_threshold_days: u32,
        dry_run: bool,
    ) -> Result<RetentionRun, CleanupError> {
        self.backend.cleanup_probe(target)?;
        let mut run = self.backend.retention_run(target, age_threshold_days, dry_run);

        let body = self
            .backend
            .cleanup_exec(target, &self.api(HttpMethod::Get, "collections"))?
            .stdout;
        let collections = self
            .parse_collections(&body)
            .map_err(|reason| CleanupError::failed(self.service(), reason))?;
        run.items_evaluated = collections.len() as u64;

        for name in collections {
            if !self.config.stale_prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                continue;
            }
            let Some(created) = date_stamp(&name) else {
                tracing::warn!(service = self.service(), collection = %name, "stale-prefixed collection has no date stamp, keeping it");
                continue;
            };
            if !is_expired(created, run.executed_at, age_threshold_days) {
                continue;
            }
            if !is_plain_name(&name) {
                tracing::warn!(service = self.service(), collection = %name, "collection name not addressable, keeping it");
                continue;
            }

            run.items_eligible += 1;
            if dry_run {
                tracing::info!(service = self.service(), collection = %name, "[DRY RUN] would drop stale collection");
                continue;
            }
            self.backend
                .cleanup_exec(target, &self.api(HttpMethod::Delete, &format!("collections/{}", name)))?;
            tracing::info!(service = self.service(), collection = %name, "dropped stale collection");
            run.items_removed += 1;
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{ScriptedRuntime, backend};
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;

    const COLLECTIONS: &str = r#"{"result":{"collections":[
        {"name":"documents"},
        {"name":"tmp_import_20260401"},
        {"name":"test_eval_20260428"},
        {"name":"temp_scratch"}
    ]},"status":"ok","time":0.0001}"#;

    fn adapter(runtime: Arc<ScriptedRuntime>, root: &std::path::Path) -> VectorAdapter {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 2, 0, 0).unwrap();
        let (backend, _) = backend(runtime, root, now);
        VectorAdapter::new(backend, VectorConfig::default())
    }

    fn target() -> Target<'static> {
        Target::new("production", Duration::from_secs(60))
    }

    #[test]
    fn test_date_stamp() {
        assert_eq!(
            date_stamp("tmp_import_20260401"),
            Some(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(date_stamp("temp_scratch"), None);
        assert_eq!(date_stamp("tmp_20261341"), None);
    }

    #[test]
    fn test_cleanup_drops_only_dated_expired_collections() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply(COLLECTIONS).reply(r#"{"result":true}"#);
        let adapter = adapter(runtime.clone(), dir.path());

        let run = adapter.cleanup(&target(), 7, false).unwrap();
        assert_eq!(run.items_evaluated, 4);
        assert_eq!(run.items_eligible, 1);
        assert_eq!(run.items_removed, 1);
        assert_eq!(
            runtime.calls()[1],
            "curl -sS --fail -X DELETE http://localhost:6333/collections/tmp_import_20260401"
        );
    }

    #[test]
    fn test_collection_backup_snapshots_each_collection() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime
            .reply(r#"{"result":{"collections":[{"name":"documents"},{"name":"faq"}]}}"#)
            .reply("{}")
            .reply("{}")
            .reply("tar-bytes");
        let adapter = adapter(runtime.clone(), dir.path());

        let artifact = adapter.backup(&target(), BackupType::Collection).unwrap();
        assert_eq!(artifact.backup_type, BackupType::Collection);
        let calls = runtime.calls();
        assert!(calls[1].ends_with("/collections/documents/snapshots"));
        assert!(calls[2].ends_with("/collections/faq/snapshots"));
        assert_eq!(calls[3], "tar -C /qdrant/snapshots -cf - .");
    }

    #[test]
    fn test_malformed_reply_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply("<html>bad gateway</html>");
        let adapter = adapter(runtime, dir.path());
        assert!(matches!(
            adapter.cleanup(&target(), 7, true),
            Err(CleanupError::Failed { .. })
        ));
    }
}
