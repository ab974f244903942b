//! In-memory cache store (Redis).
//!
//! `snapshot` triggers `BGSAVE`, waits for `LASTSAVE` to advance and then
//! streams the RDB file. `append-log` archives whatever append-only files
//! exist (best effort: persistence may be configured without AOF).
//!
//! Cleanup never deletes keys. It gives keys in the configured namespaces
//! that have no expiry a TTL of `retention_days`; keys that already carry a
//! TTL are left alone. `retention_days = 0` still assigns a TTL of one
//! second, since `EXPIRE key 0` deletes the key on the spot.

use std::thread;
use std::time::Duration;

use super::{Adapter, Backend, Target, ensure_supported};
use crate::artifact::BackupArtifact;
use crate::commands::fs::{CatArgs, ListDirArgs, TarArgs};
use crate::commands::redis::{RedisCliArgs, RedisCommand};
use crate::config::{CacheConfig, secret_from_env};
use crate::error::{BackupError, CleanupError};
use crate::retention::RetentionRun;
use crate::types::{BackendKind, BackupType};

const SUPPORTED: &[BackupType] = &[BackupType::Snapshot, BackupType::AppendLog];
const DEFAULTS: &[BackupType] = &[BackupType::Snapshot];

/// Append-only persistence files, newest layout first
const AOF_CANDIDATES: &[&str] = &["appendonlydir", "appendonly.aof"];

const SECONDS_PER_DAY: u64 = 86_400;

/// Shortest TTL ever assigned
const MIN_TTL_SECONDS: u64 = 1;

pub struct CacheAdapter {
    backend: Backend,
    config: CacheConfig,
    poll_interval: Duration,
}

impl CacheAdapter {
    pub fn new(backend: Backend, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// How often `LASTSAVE` is polled while a background save runs
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn redis(&self, command: RedisCommand) -> RedisCliArgs {
        RedisCliArgs::new(secret_from_env(self.config.password_env.as_deref()), command)
    }

    fn last_save(&self, target: &Target<'_>) -> Result<i64, BackupError> {
        let out = self.backend.backup_exec(target, &self.redis(RedisCommand::LastSave))?;
        out.stdout.trim().parse().map_err(|_| {
            BackupError::command(self.service(), format!("unexpected LASTSAVE reply '{}'", out.stdout.trim()))
        })
    }

    fn snapshot(&self, target: &Target<'_>) -> Result<BackupArtifact, BackupError> {
        let before = self.last_save(target)?;
        self.backend.backup_exec(target, &self.redis(RedisCommand::BgSave))?;

        loop {
            if self.last_save(target)? > before {
                break;
            }
            if target.remaining() < self.poll_interval {
                return Err(BackupError::command(
                    self.service(),
                    "background save did not finish within the time budget",
                ));
            }
            thread::sleep(self.poll_interval);
        }

        let cat = CatArgs {
            path: format!("{}/{}", self.config.data_dir.trim_end_matches('/'), self.config.rdb_file),
        };
        self.backend.stream_artifact(target, BackupType::Snapshot, &cat)
    }

    fn append_log(&self, target: &Target<'_>) -> Result<BackupArtifact, BackupError> {
        let listing = self.backend.backup_exec(
            target,
            &ListDirArgs {
                path: self.config.data_dir.clone(),
            },
        )?;
        let present: Vec<String> = listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| AOF_CANDIDATES.contains(name))
            .map(String::from)
            .collect();

        if present.is_empty() {
            return Err(BackupError::command(
                self.service(),
                "append-only persistence is not enabled (no AOF files found)",
            ));
        }

        let tar = TarArgs {
            directory: self.config.data_dir.clone(),
            members: present,
            excludes: Vec::new(),
        };
        self.backend.stream_artifact(target, BackupType::AppendLog, &tar)
    }
}

impl Adapter for CacheAdapter {
    fn service(&self) -> &str {
        self.backend.service()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cache
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
            BackupType::AppendLog => self.append_log(target),
            _ => self.snapshot(target),
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
        let ttl_seconds = (u64::from(age_threshold_days) * SECONDS_PER_DAY).max(MIN_TTL_SECONDS);

        for namespace in &self.config.namespaces {
            let scan = self.redis(RedisCommand::Scan {
                pattern: format!("{}*", namespace),
            });
            let keys: Vec<String> = self
                .backend
                .cleanup_exec(target, &scan)?
                .stdout
                .lines()
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
            run.items_evaluated += keys.len() as u64;

            for key in keys {
                let ttl = self
                    .backend
                    .cleanup_exec(target, &self.redis(RedisCommand::Ttl { key: key.clone() }))?;
                // -1: no expiry; -2: key vanished since the scan
                if ttl.stdout.trim() != "-1" {
                    continue;
                }
                run.items_eligible += 1;
                if dry_run {
                    continue;
                }

                let reply = self.backend.cleanup_exec(
                    target,
                    &self.redis(RedisCommand::Expire {
                        key: key.clone(),
                        seconds: ttl_seconds,
                    }),
                )?;
                if reply.stdout.trim() == "1" {
                    run.items_removed += 1;
                }
            }
        }

        if dry_run {
            tracing::info!(service = self.service(), eligible = run.items_eligible, "[DRY RUN] would assign TTL to keys without expiry");
        } else {
            tracing::info!(service = self.service(), updated = run.items_removed, ttl_seconds, "assigned TTL to keys without expiry");
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

    fn adapter(runtime: Arc<ScriptedRuntime>, root: &std::path::Path) -> CacheAdapter {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 2, 0, 0).unwrap();
        let (backend, _) = backend(runtime, root, now);
        CacheAdapter::new(backend, CacheConfig::default()).with_poll_interval(Duration::from_millis(1))
    }

    fn target() -> Target<'static> {
        Target::new("production", Duration::from_secs(60))
    }

    #[test]
    fn test_snapshot_waits_for_lastsave() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime
            .reply("1700000000")
            .reply("Background saving started")
            .reply("1700000000")
            .reply("1700000042")
            .reply("REDIS0011...");
        let adapter = adapter(runtime.clone(), dir.path());

        let artifact = adapter.backup(&target(), BackupType::Snapshot).unwrap();
        assert!(artifact.path.to_string_lossy().ends_with(".rdb"));
        assert_eq!(runtime.calls().last().unwrap(), "cat /data/dump.rdb");
    }

    #[test]
    fn test_append_log_requires_aof() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply("dump.rdb\n");
        let adapter = adapter(runtime, dir.path());
        assert!(matches!(
            adapter.backup(&target(), BackupType::AppendLog),
            Err(BackupError::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_append_log_archives_present_files() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply("appendonlydir\ndump.rdb\n").reply("tar-bytes");
        let adapter = adapter(runtime.clone(), dir.path());

        adapter.backup(&target(), BackupType::AppendLog).unwrap();
        assert_eq!(runtime.calls()[1], "tar -C /data -cf - appendonlydir");
    }

    #[test]
    fn test_cleanup_only_touches_keys_without_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime
            .reply("cache:a\ncache:b\n")
            .reply("-1")
            .reply("1")
            .reply("3600")
            .reply("session:x\n")
            .reply("-2");
        let adapter = adapter(runtime.clone(), dir.path());

        let run = adapter.cleanup(&target(), 7, false).unwrap();
        assert_eq!(run.items_evaluated, 3);
        assert_eq!(run.items_eligible, 1);
        assert_eq!(run.items_removed, 1);
        assert!(runtime.calls().contains(&"redis-cli --raw EXPIRE cache:a 604800".to_string()));
    }

    #[test]
    fn test_cleanup_zero_days_sets_shortest_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply("cache:a\n").reply("-1").reply("1").reply("");
        let adapter = adapter(runtime.clone(), dir.path());

        let run = adapter.cleanup(&target(), 0, false).unwrap();
        assert_eq!(run.items_removed, 1);
        let calls = runtime.calls();
        assert!(calls.contains(&"redis-cli --raw EXPIRE cache:a 1".to_string()));
        assert!(!calls.iter().any(|c| c.ends_with(" 0")));
    }

    #[test]
    fn test_cleanup_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::offline());
        let adapter = adapter(runtime, dir.path());
        assert!(matches!(
            adapter.cleanup(&target(), 7, true),
            Err(CleanupError::ServiceUnavailable { .. })
        ));
    }
}
