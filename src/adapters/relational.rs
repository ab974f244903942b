//! Relational store (PostgreSQL).
//!
//! Backups are plain SQL scripts from `pg_dump`. Cleanup expires rows of
//! the configured ephemeral tables by their timestamp column, then runs
//! `VACUUM ANALYZE` on every table it deleted from.

use super::{Adapter, Backend, Target, ensure_supported, parse_count};
use crate::artifact::BackupArtifact;
use crate::commands::postgres::{DumpMode, PgConnection, PgDumpArgs, PsqlArgs, SqlStatement};
use crate::config::{RelationalConfig, secret_from_env};
use crate::error::{BackupError, CleanupError};
use crate::retention::RetentionRun;
use crate::types::{BackendKind, BackupType};

const SUPPORTED: &[BackupType] = &[BackupType::Full, BackupType::Schema, BackupType::Data];
const DEFAULTS: &[BackupType] = &[BackupType::Full];

pub struct RelationalAdapter {
    backend: Backend,
    config: RelationalConfig,
}

impl RelationalAdapter {
    pub fn new(backend: Backend, config: RelationalConfig) -> Self {
        Self { backend, config }
    }

    fn connection(&self) -> PgConnection {
        PgConnection {
            user: self.config.user.clone(),
            database: self.config.database.clone(),
            password: secret_from_env(self.config.password_env.as_deref()),
        }
    }

    fn query(&self, target: &Target<'_>, statement: SqlStatement) -> Result<String, CleanupError> {
        let psql = PsqlArgs {
            connection: self.connection(),
            statement,
        };
        Ok(self.backend.cleanup_exec(target, &psql)?.stdout)
    }

    fn count(&self, target: &Target<'_>, statement: SqlStatement) -> Result<u64, CleanupError> {
        let stdout = self.query(target, statement)?;
        parse_count(self.backend.service(), &stdout)
    }
}

impl Adapter for RelationalAdapter {
    fn service(&self) -> &str {
        self.backend.service()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn supported_backup_types(&self) -> &'static [BackupType] {
        SUPPORTED
    }

    fn default_backup_types(&self) -> &'static [BackupType] {
        DEFAULTS
    }

    fn backup(&self, target: &Target<'_>, backup_type: BackupType) -> Result<BackupArtifact, BackupError> {
        ensure_supported(self, backup_type)?;
        let mode = DumpMode::for_backup_type(backup_type).ok_or_else(|| {
            BackupError::command(self.service(), format!("no dump mode for '{}'", backup_type))
        })?;

        self.backend.backup_probe(target)?;
        let dump = PgDumpArgs {
            connection: self.connection(),
            mode,
        };
        self.backend.stream_artifact(target, backup_type, &dump)
    }

    fn cleanup(
        &self,
        target: &Target<'_>,
        age_threshold_days: u32,
        dry_run: bool,
    ) -> Result<RetentionRun, CleanupError> {
        self.backend.cleanup_probe(target)?;
        let mut run = self.backend.retention_run(target, age_threshold_days, dry_run);
        let mut touched = Vec::new();

        for ephemeral in &self.config.ephemeral_tables {
            let table = ephemeral.table.clone();
            let exists = self.query(target, SqlStatement::TableExists { table: table.clone() })?;
            if exists.trim() != "t" {
                tracing::debug!(service = self.service(), table = %table, "table does not exist, skipping");
                continue;
            }

            run.items_evaluated += self.count(target, SqlStatement::CountAll { table: table.clone() })?;
            let eligible = self.count(
                target,
                SqlStatement::CountExpired {
                    table: table.clone(),
                    column: ephemeral.column.clone(),
                    days: age_threshold_days,
                },
            )?;
            run.items_eligible += eligible;

            if dry_run {
                tracing::info!(service = self.service(), table = %table, eligible, "[DRY RUN] would delete expired rows");
                continue;
            }
            if eligible == 0 {
                continue;
            }

            let deleted = self.count(
                target,
                SqlStatement::DeleteExpired {
                    table: table.clone(),
                    column: ephemeral.column.clone(),
                    days: age_threshold_days,
                },
            )?;
            tracing::info!(service = self.service(), table = %table, deleted, "deleted expired rows");
            run.items_removed += deleted;
            touched.push(table);
        }

        for table in touched {
            self.query(target, SqlStatement::VacuumAnalyze { table })?;
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{ScriptedRuntime, backend};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter(runtime: Arc<ScriptedRuntime>, root: &std::path::Path) -> RelationalAdapter {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 2, 0, 0).unwrap();
        let (backend, _) = backend(runtime, root, now);
        RelationalAdapter::new(backend, RelationalConfig::default())
    }

    fn target() -> Target<'static> {
        Target::new("production", Duration::from_secs(60))
    }

    #[test]
    fn test_backup_writes_dump() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply("-- PostgreSQL database dump\n");
        let adapter = adapter(runtime.clone(), dir.path());

        let artifact = adapter.backup(&target(), BackupType::Schema).unwrap();
        assert_eq!(artifact.backup_type, BackupType::Schema);
        assert!(artifact.path.ends_with("production/svc/schema/svc_schema_20260501_020000.sql"));
        assert!(runtime.calls()[0].ends_with("--schema-only"));
    }

    #[test]
    fn test_backup_rejects_foreign_type() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let adapter = adapter(runtime.clone(), dir.path());
        assert!(matches!(
            adapter.backup(&target(), BackupType::Snapshot),
            Err(BackupError::UnsupportedBackupType { .. })
        ));
        assert!(runtime.calls().is_empty());
    }

    #[test]
    fn test_cleanup_deletes_and_vacuums() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        // logs: exists, 100 rows, 40 expired, 40 deleted; sessions: missing
        runtime.reply("t").reply("100").reply("40").reply("40").reply("f").reply("");
        let adapter = adapter(runtime.clone(), dir.path());

        let run = adapter.cleanup(&target(), 14, false).unwrap();
        assert_eq!(run.items_evaluated, 100);
        assert_eq!(run.items_eligible, 40);
        assert_eq!(run.items_removed, 40);
        let calls = runtime.calls();
        assert_eq!(calls.len(), 6);
        assert!(calls[3].contains("DELETE FROM logs WHERE created_at < now() - interval '1 day' * 14"));
        assert!(calls[5].ends_with("VACUUM ANALYZE logs"));
    }

    #[test]
    fn test_cleanup_dry_run_only_counts() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime
            .reply("t").reply("10").reply("3")
            .reply("t").reply("5").reply("5");
        let adapter = adapter(runtime.clone(), dir.path());

        let run = adapter.cleanup(&target(), 7, true).unwrap();
        assert_eq!(run.items_eligible, 8);
        assert_eq!(run.items_removed, 0);
        assert!(runtime.calls().iter().all(|c| !c.contains("DELETE") && !c.contains("VACUUM")));
    }

    #[test]
    fn test_cleanup_unparseable_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply("t").reply("ERROR: permission denied");
        let adapter = adapter(runtime, dir.path());
        assert!(matches!(
            adapter.cleanup(&target(), 7, false),
            Err(CleanupError::Failed { .. })
        ));
    }
}
