//! Age-based retention.
//!
//! # Boundary Rule
//!
//! An item is eligible for removal only when `now - created` is strictly
//! greater than `retention_days × 24h`. An item exactly at the boundary is
//! kept. The same rule applies to backend data (rows, keys, collections,
//! files) and to local backup artifacts.
//!
//! # Dry Run
//!
//! A dry run evaluates eligibility exactly as a real run would but performs
//! no mutation, neither in the backend nor in the artifact tree. Its
//! [`RetentionRun`] reports `items_eligible` and `items_removed = 0`.

use std::fs;
use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::adapters::{AdapterRegistry, Target};
use crate::artifact::ArtifactStore;
use crate::config::EngineConfig;
use crate::error::{CleanupError, LockError, Result};
use crate::lock::ServiceLock;
use crate::policy::PolicyKey;
use crate::policy::resolver::PolicyResolver;
use crate::process_guard::CancelFlag;
use crate::types::BackupType;

/// `now - created > days × 24h`
pub fn is_expired(created: DateTime<Utc>, now: DateTime<Utc>, days: u32) -> bool {
    now.signed_duration_since(created) > chrono::Duration::days(i64::from(days))
}

/// What a retention run was applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RetentionTarget {
    /// Data inside the running service
    Backend,
    /// Local backup artifacts of the service
    Artifacts,
}

/// Outcome of one cleanup execution against one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRun {
    pub environment: String,
    pub service: String,
    pub target: RetentionTarget,
    pub executed_at: DateTime<Utc>,
    pub age_threshold_days: u32,
    pub items_evaluated: u64,
    pub items_eligible: u64,
    pub items_removed: u64,
    pub dry_run: bool,
}

impl RetentionRun {
    pub fn new(
        environment: &str,
        service: &str,
        target: RetentionTarget,
        executed_at: DateTime<Utc>,
        age_threshold_days: u32,
        dry_run: bool,
    ) -> Self {
        Self {
            environment: environment.to_string(),
            service: service.to_string(),
            target,
            executed_at,
            age_threshold_days,
            items_evaluated: 0,
            items_eligible: 0,
            items_removed: 0,
            dry_run,
        }
    }

    pub fn render(&self) -> String {
        let line = if self.dry_run {
            format!(
                "{} {}: {} evaluated, {} would be removed (older than {}d)",
                self.service, self.target, self.items_evaluated, self.items_eligible, self.age_threshold_days
            )
        } else {
            format!(
                "{} {}: {} evaluated, {} removed (older than {}d)",
                self.service, self.target, self.items_evaluated, self.items_removed, self.age_threshold_days
            )
        };
        label_dry_run(self.dry_run, line)
    }
}

pub(crate) fn label_dry_run(dry_run: bool, line: String) -> String {
    if dry_run {
        format!("[DRY RUN] {}", line)
    } else {
        line
    }
}

/// Remove local artifacts of one service (optionally one backup type) that
/// are strictly older than `days`.
pub fn prune_artifacts(
    store: &ArtifactStore,
    environment: &str,
    service: &str,
    backup_type: Option<BackupType>,
    days: u32,
    dry_run: bool,
) -> io::Result<RetentionRun> {
    let now = store.now();
    let artifacts = match backup_type {
        Some(ty) => store.list_type(environment, service, ty)?,
        None => store.list(environment, Some(service))?,
    };

    let mut run = RetentionRun::new(environment, service, RetentionTarget::Artifacts, now, days, dry_run);
    run.items_evaluated = artifacts.len() as u64;

    for artifact in artifacts.iter().filter(|a| is_expired(a.created_at, now, days)) {
        run.items_eligible += 1;
        if dry_run {
            tracing::info!(path = %artifact.path.display(), "[DRY RUN] would remove expired artifact");
            continue;
        }
        match fs::remove_file(&artifact.path) {
            Ok(()) => {
                tracing::info!(path = %artifact.path.display(), "removed expired artifact");
                run.items_removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    Ok(run)
}

// ============================================================================
// Cleaner
// ============================================================================

/// One cleanup target's outcome
#[derive(Debug)]
pub struct CleanupResult {
    pub service: String,
    pub outcome: std::result::Result<RetentionRun, CleanupError>,
}

/// Result list of one cleanup invocation
#[derive(Debug)]
pub struct CleanupReport {
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<CleanupResult>,
    /// Services with `cleanup_enabled: false`
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

impl CleanupReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && !self.cancelled
    }

    pub fn runs(&self) -> impl Iterator<Item = &RetentionRun> {
        self.results.iter().filter_map(|r| r.outcome.as_ref().ok())
    }

    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for result in &self.results {
            match &result.outcome {
                Ok(run) => lines.push(format!("ok      {}", run.render())),
                Err(e) => lines.push(format!("FAILED  {}", e)),
            }
        }
        for service in &self.skipped {
            lines.push(format!("skipped {}: cleanup disabled by policy", service));
        }
        lines.push(self.summary());
        lines
    }

    pub fn summary(&self) -> String {
        let elapsed = (self.finished_at - self.started_at).num_seconds();
        let mut summary = format!(
            "cleanup {}: {} succeeded, {} failed in {}s",
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

/// Runs age-based cleanup for the services of an environment
pub struct RetentionCleaner<'a> {
    config: &'a EngineConfig,
    registry: &'a AdapterRegistry,
    resolver: PolicyResolver<'a>,
    store: &'a ArtifactStore,
    cancel: CancelFlag,
}

impl<'a> RetentionCleaner<'a> {
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

    /// Clean one service or every service of `environment`.
    ///
    /// Unknown environments and services fail before any backend is
    /// touched. `force_dry_run` overrides the resolved `dry_run`.
    pub fn run_cleanup(
        &self,
        environment: &str,
        service: Option<&str>,
        force_dry_run: bool,
    ) -> Result<CleanupReport> {
        let services = target_services(self.config, self.registry, environment, service)?;
        let started_at = self.store.now();
        let mut report = CleanupReport {
            environment: environment.to_string(),
            started_at,
            finished_at: started_at,
            results: Vec::new(),
            skipped: Vec::new(),
            cancelled: false,
        };

        for service in services {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !self.clean_service(environment, &service, force_dry_run, &mut report) {
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
            "cleanup finished"
        );
        Ok(report)
    }

    /// Returns `false` when the run was cancelled mid-service
    fn clean_service(
        &self,
        environment: &str,
        service: &str,
        force_dry_run: bool,
        report: &mut CleanupReport,
    ) -> bool {
        let resolver = &self.resolver;
        if !resolver.flag(environment, Some(service), PolicyKey::CleanupEnabled) {
            tracing::info!(environment, service, "cleanup disabled by policy, skipping");
            report.skipped.push(service.to_string());
            return true;
        }

        let push = |report: &mut CleanupReport, outcome| {
            report.results.push(CleanupResult {
                service: service.to_string(),
                outcome,
            })
        };

        let _lock = match ServiceLock::acquire(&self.store.service_dir(environment, service)) {
            Ok(lock) => lock,
            Err(LockError::Contended { .. }) => {
                tracing::warn!(environment, service, "service is locked by another run");
                push(report, Err(CleanupError::InProgress { service: service.to_string() }));
                return true;
            }
            Err(e) => {
                push(report, Err(CleanupError::failed(service, e.to_string())));
                return true;
            }
        };

        let days = resolver.retention_days(environment, service);
        let dry_run = force_dry_run || resolver.flag(environment, Some(service), PolicyKey::DryRun);
        let timeout: Duration = resolver.timeout(environment, service);

        if !dry_run {
            if let Err(e) = self.store.discard_partials(environment, service) {
                tracing::warn!(environment, service, error = %e, "could not sweep partial artifacts");
            }
        }

        tracing::info!(environment, service, days, dry_run, "running cleanup");
        let backend = match self.registry.adapter_for(service) {
            Ok(adapter) => adapter.cleanup(&Target::new(environment, timeout), days, dry_run),
            Err(e) => Err(CleanupError::failed(service, e.to_string())),
        };
        let cancelled = matches!(backend, Err(CleanupError::Cancelled { .. }));
        match &backend {
            Ok(run) => tracing::info!(
                environment,
                service,
                evaluated = run.items_evaluated,
                eligible = run.items_eligible,
                removed = run.items_removed,
                "backend cleanup complete"
            ),
            Err(e) => tracing::error!(environment, service, error = %e, "backend cleanup failed"),
        }
        push(report, backend);
        if cancelled {
            return false;
        }

        let artifacts = prune_artifacts(self.store, environment, service, None, days, dry_run)
            .map_err(|e| CleanupError::failed(service, format!("artifact prune: {}", e)));
        push(report, artifacts);
        true
    }
}

/// Validate the (environment, service) selection and return the services
/// to process, in configuration order.
pub(crate) fn target_services(
    config: &EngineConfig,
    registry: &AdapterRegistry,
    environment: &str,
    service: Option<&str>,
) -> Result<Vec<String>> {
    let services = match service {
        Some(service) => {
            config.ensure_member(environment, service)?;
            vec![service.to_string()]
        }
        None => config.services_for(environment)?.to_vec(),
    };
    for service in &services {
        registry.adapter_for(service)?;
    }
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_boundary_is_strict() {
        let days = 7;
        let exactly = now() - chrono::Duration::days(7);
        assert!(!is_expired(exactly, now(), days));
        assert!(is_expired(exactly - chrono::Duration::seconds(1), now(), days));
        assert!(!is_expired(now(), now(), 0));
        assert!(is_expired(now() - chrono::Duration::seconds(1), now(), 0));
    }

    fn seed(store: &ArtifactStore, ages_days: &[i64]) {
        for age in ages_days {
            let created = now() - chrono::Duration::days(*age);
            let dir = store.type_dir("production", "relational-store", BackupType::Full);
            fs::create_dir_all(&dir).unwrap();
            let name = crate::artifact::BackupArtifact::file_name(
                "relational-store",
                BackupType::Full,
                created,
                true,
            );
            fs::write(dir.join(name), b"x").unwrap();
        }
    }

    #[test]
    fn test_prune_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), Arc::new(FixedClock::new(now())));
        seed(&store, &[5, 10, 40]);

        let run = prune_artifacts(&store, "production", "relational-store", None, 30, false).unwrap();
        assert_eq!(run.target, RetentionTarget::Artifacts);
        assert_eq!(run.items_evaluated, 3);
        assert_eq!(run.items_eligible, 1);
        assert_eq!(run.items_removed, 1);
        assert_eq!(store.list("production", None).unwrap().len(), 2);

        let again = prune_artifacts(&store, "production", "relational-store", None, 30, false).unwrap();
        assert_eq!(again.items_removed, 0);
    }

    #[test]
    fn test_prune_dry_run_reports_without_removing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), Arc::new(FixedClock::new(now())));
        seed(&store, &[5, 10, 40]);

        let run = prune_artifacts(&store, "production", "relational-store", None, 7, true).unwrap();
        assert!(run.dry_run);
        assert_eq!(run.items_eligible, 2);
        assert_eq!(run.items_removed, 0);
        assert_eq!(store.list("production", None).unwrap().len(), 3);
        assert!(run.render().starts_with("[DRY RUN] "));
    }
}
