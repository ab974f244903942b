//! Backup execution.
//!
//! For each target service, in configuration order:
//!
//! 1. resolve `backup_types`, `compression`, `cleanup_enabled`, `dry_run`,
//!    `retention_days` and `timeout_seconds`
//! 2. take the service lock and sweep partials left by killed runs
//! 3. run the adapter's backup for every backup type
//! 4. gzip the artifact when `compression` is on
//! 5. prune the artifact's own directory when `cleanup_enabled` is on
//!
//! Failures stay local to their (service, backup type); the run keeps
//! going and succeeds only with zero failures.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::adapters::{Adapter, AdapterRegistry, Target, ensure_supported};
use crate::artifact::{ArtifactStore, BackupArtifact};
use crate::config::EngineConfig;
use crate::error::{BackupError, LockError, Result};
use crate::lock::ServiceLock;
use crate::policy::PolicyKey;
use crate::policy::resolver::PolicyResolver;
use crate::process_guard::CancelFlag;
use crate::retention::{RetentionRun, label_dry_run, prune_artifacts, target_services};
use crate::types::BackupType;

/// Outcome of one (service, backup type)
#[derive(Debug)]
pub struct BackupResult {
    pub service: String,
    pub backup_type: BackupType,
    pub outcome: std::result::Result<BackupArtifact, BackupError>,
    /// Non-fatal problems (compression, prune)
    pub warnings: Vec<String>,
    pub pruned: Option<RetentionRun>,
}

/// Result list of one backup invocation
#[derive(Debug)]
pub struct BackupReport {
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<BackupResult>,
    pub cancelled: bool,
}

impl BackupReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && !self.cancelled
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &BackupArtifact> {
        self.results.iter().filter_map(|r| r.outcome.as_ref().ok())
    }

    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for result in &self.results {
            match &result.outcome {
                Ok(artifact) => lines.push(format!(
                    "ok      {} {} -> {} ({} bytes{})",
                    result.service,
                    result.backup_type,
                    artifact.path.display(),
                    artifact.size_bytes,
                    if artifact.compressed { ", gzip" } else { "" }
                )),
                Err(e) => lines.push(format!("FAILED  {}", e)),
            }
            for warning in &result.warnings {
                lines.push(format!("warning {} {}: {}", result.service, result.backup_type, warning));
            }
            if let Some(run) = result.pruned.as_ref().filter(|r| r.items_eligible > 0) {
                let line = if run.dry_run {
                    format!("prune   {} {}: {} would be removed", result.service, result.backup_type, run.items_eligible)
                } else {
                    format!("prune   {} {}: {} removed", result.service, result.backup_type, run.items_removed)
                };
                lines.push(label_dry_run(run.dry_run, line));
            }
        }
        lines.push(self.summary());
        lines
    }

    pub fn summary(&self) -> String {
        let elapsed = (self.finished_at - self.started_at).num_seconds();
        let mut summary = format!(
            "backup {}: {} succeeded, {} failed in {}s",
            self.environment,
            self.succeeded(),
            self.failed(),
            elapsed
        );
        if self.cancelled {
            summary.push_str(" (cancelled)");
        }
        summary
    }
}

/// Resolved per-service settings
struct ServicePlan {
    backup_types: Vec<BackupType>,
    compression: bool,
    cleanup_enabled: bool,
    dry_run: bool,
    retention_days: u32,
    timeout: Duration,
}

pub struct BackupExecutor<'a> {
    config: &'a EngineConfig,
    registry: &'a AdapterRegistry,
    resolver: PolicyResolver<'a>,
    store: &'a ArtifactStore,
    cancel: CancelFlag,
}

impl<'a> BackupExecutor<'a> {
    pub fn new(
        config: &'a EngineConfig,
        registry: &'a AdapterRegistry,
        resolver: PolicyResolver<'a>,
        store: &'a ArtifactStore,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            config,
            registry,
            resolver,
            store,
            cancel,
        }
    }

    /// Back up one service or every service of `environment`.
    ///
    /// `backup_type = None` runs the policy's `backup_types`, or the
    /// adapter's defaults when policy names none.
    pub fn run_backup(
        &self,
        environment: &str,
        service: Option<&str>,
        backup_type: Option<BackupType>,
    ) -> Result<BackupReport> {
        let services = target_services(self.config, self.registry, environment, service)?;
        let started_at = self.store.now();
        let mut report = BackupReport {
            environment: environment.to_string(),
            started_at,
            finished_at: started_at,
            results: Vec::new(),
            cancelled: false,
        };

        for service in services {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let adapter = self.registry.adapter_for(&service)?;
            if !self.backup_service(environment, adapter, backup_type, &mut report.results) {
                report.cancelled = true;
                break;
            }
        }

        report.finished_at = self.store.now();
        tracing::info!(
            environment,
            succeeded = report.succeeded(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "backup finished"
        );
        Ok(report)
    }

    fn plan(&self, environment: &str, adapter: &dyn Adapter, explicit: Option<BackupType>) -> ServicePlan {
        let service = adapter.service();
        let resolver = &self.resolver;
        let backup_types = match explicit {
            Some(ty) => vec![ty],
            None => {
                let from_policy = resolver.backup_types(environment, service);
                if from_policy.is_empty() {
                    adapter.default_backup_types().to_vec()
                } else {
                    from_policy
                }
            }
        };

        ServicePlan {
            backup_types,
            compression: resolver.flag(environment, Some(service), PolicyKey::Compression),
            cleanup_enabled: resolver.flag(environment, Some(service), PolicyKey::CleanupEnabled),
            dry_run: resolver.flag(environment, Some(service), PolicyKey::DryRun),
            retention_days: resolver.retention_days(environment, service),
            timeout: resolver.timeout(environment, service),
        }
    }

    /// Returns `false` when the run was cancelled
    fn backup_service(
        &self,
        environment: &str,
        adapter: &dyn Adapter,
        explicit: Option<BackupType>,
        results: &mut Vec<BackupResult>,
    ) -> bool {
        let service = adapter.service();
        let plan = self.plan(environment, adapter, explicit);
        let record = |results: &mut Vec<BackupResult>, backup_type, outcome| {
            results.push(BackupResult {
                service: service.to_string(),
                backup_type,
                outcome,
                warnings: Vec::new(),
                pruned: None,
            })
        };

        let _lock = match ServiceLock::acquire(&self.store.service_dir(environment, service)) {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!(environment, service, error = %e, "cannot lock service");
                for ty in &plan.backup_types {
                    let err = match &e {
                        LockError::Contended { .. } => BackupError::InProgress {
                            service: service.to_string(),
                        },
                        LockError::Io { .. } => BackupError::command(service, e.to_string()),
                    };
                    record(results, *ty, Err(err));
                }
                return true;
            }
        };

        match self.store.discard_partials(environment, service) {
            Ok(0) => {}
            Ok(n) => tracing::info!(environment, service, discarded = n, "swept partial artifacts"),
            Err(e) => tracing::warn!(environment, service, error = %e, "could not sweep partial artifacts"),
        }

        let target = Target::new(environment, plan.timeout);
        let mut unavailable: Option<String> = None;

        for &backup_type in &plan.backup_types {
            if self.cancel.is_cancelled() {
                return false;
            }
            if let Err(e) = ensure_supported(adapter, backup_type) {
                tracing::error!(environment, service, error = %e, "unsupported backup type");
                record(results, backup_type, Err(e));
                continue;
            }
            if let Some(reason) = &unavailable {
                record(
                    results,
                    backup_type,
                    Err(BackupError::ServiceUnavailable {
                        service: service.to_string(),
                        reason: reason.clone(),
                    }),
                );
                continue;
            }

            tracing::info!(environment, service, %backup_type, "starting backup");
            match adapter.backup(&target, backup_type) {
                Ok(artifact) => {
                    let result = self.finish(environment, service, backup_type, artifact, &plan);
                    results.push(result);
                }
                Err(e) => {
                    tracing::error!(environment, service, %backup_type, error = %e, "backup failed");
                    let cancelled = matches!(e, BackupError::Cancelled { .. });
                    if let BackupError::ServiceUnavailable { reason, .. } = &e {
                        unavailable = Some(reason.clone());
                    }
                    record(results, backup_type, Err(e));
                    if cancelled {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Compression and prune for a freshly written artifact
    fn finish(
        &self,
        environment: &str,
        service: &str,
        backup_type: BackupType,
        artifact: BackupArtifact,
        plan: &ServicePlan,
    ) -> BackupResult {
        let mut warnings = Vec::new();

        let artifact = if plan.compression {
            match self.store.compress(&artifact) {
                Ok(compressed) => compressed,
                Err(e) => {
                    tracing::warn!(environment, service, error = %e, "compression failed, keeping uncompressed artifact");
                    warnings.push(format!("compression failed: {}", e));
                    artifact
                }
            }
        } else {
            artifact
        };
        tracing::info!(
            environment,
            service,
            %backup_type,
            path = %artifact.path.display(),
            size_bytes = artifact.size_bytes,
            "backup complete"
        );

        let pruned = if plan.cleanup_enabled {
            match prune_artifacts(
                self.store,
                environment,
                service,
                Some(backup_type),
                plan.retention_days,
                plan.dry_run,
            ) {
                Ok(run) => Some(run),
                Err(e) => {
                    tracing::warn!(environment, service, error = %e, "artifact prune failed");
                    warnings.push(format!("prune failed: {}", e));
                    None
                }
            }
        } else {
            None
        };

        BackupResult {
            service: service.to_string(),
            backup_type,
            outcome: Ok(artifact),
            warnings,
            pruned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::CacheAdapter;
    use crate::adapters::testing::{ScriptedRuntime, backend};
    use crate::config::CacheConfig;
    use crate::policy::PolicyStore;
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::Arc;

    const CONFIG: &str = r#"
backup_root: backups
policies: { retention: r.yaml, strategy: s.yaml }
environments:
  production: { services: [svc] }
services:
  svc: { kind: cache, container: "stack-{env}-svc" }
"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 2, 0, 0).unwrap()
    }

    struct Fixture {
        config: EngineConfig,
        policies: PolicyStore,
        registry: AdapterRegistry,
        store: Arc<ArtifactStore>,
        runtime: Arc<ScriptedRuntime>,
    }

    fn fixture(root: &Path, runtime: ScriptedRuntime) -> Fixture {
        let config = EngineConfig::from_yaml(CONFIG, root).unwrap();
        let policies = PolicyStore::from_yaml(&[(
            "s.yaml",
            "services:\n  svc:\n    backup_types: [snapshot, append-log]\n",
        )])
        .unwrap();
        let runtime = Arc::new(runtime);
        let (backend, store) = backend(runtime.clone(), &config.backup_root, now());
        let mut registry = AdapterRegistry::new();
        registry.register(Box::new(CacheAdapter::new(backend, CacheConfig::default())));
        Fixture {
            config,
            policies,
            registry,
            store,
            runtime,
        }
    }

    impl Fixture {
        fn run(&self, backup_type: Option<BackupType>) -> BackupReport {
            BackupExecutor::new(
                &self.config,
                &self.registry,
                PolicyResolver::new(&self.policies),
                &self.store,
                CancelFlag::new(),
            )
            .run_backup("production", None, backup_type)
            .unwrap()
        }
    }

    #[test]
    fn test_unavailable_service_skips_remaining_types() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(
            dir.path(),
            ScriptedRuntime::offline(),
        );

        let report = f.run(None);
        assert_eq!(report.results.len(), 2);
        assert!(
            report
                .results
                .iter()
                .all(|r| matches!(r.outcome, Err(BackupError::ServiceUnavailable { .. })))
        );
        assert_eq!(report.failed(), 2);
        assert!(!report.cancelled);
        assert!(f.runtime.calls().is_empty());
    }

    #[test]
    fn test_explicit_unsupported_type_fails_without_contact() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), ScriptedRuntime::default());

        let report = f.run(Some(BackupType::Schema));
        assert_eq!(report.results.len(), 1);
        assert!(matches!(
            report.results[0].outcome,
            Err(BackupError::UnsupportedBackupType { .. })
        ));
        assert!(f.runtime.calls().is_empty());
        assert!(report.summary().contains("0 succeeded, 1 failed"));
    }

    #[test]
    fn test_locked_service_reports_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), ScriptedRuntime::default());
        let _held = ServiceLock::acquire(&f.store.service_dir("production", "svc")).unwrap();

        let report = f.run(None);
        assert_eq!(report.results.len(), 2);
        assert!(
            report
                .results
                .iter()
                .all(|r| matches!(r.outcome, Err(BackupError::InProgress { .. })))
        );
        assert!(f.runtime.calls().is_empty());
    }
}
