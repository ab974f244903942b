//! Engine facade.
//!
//! Owns everything an invocation needs (configuration, policy, adapters,
//! artifact store, notification channels, event log) and exposes one method
//! per CLI operation. Construction cross-checks configuration against
//! policy, so a loaded [`Engine`] never fails later for configuration
//! reasons.
//!
//! # Operation Flow
//!
//! | Operation  | Runs                         | Event log | Notifies |
//! |------------|------------------------------|-----------|----------|
//! | `backup`   | [`BackupExecutor`]           | yes       | yes      |
//! | `cleanup`  | [`RetentionCleaner`]         | yes       | yes      |
//! | `dry_test` | forced dry-run cleanup, plan | no        | no       |
//! | `status`   | read only                    | no        | no       |
//! | `list`     | read only                    | no        | no       |

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::adapters::AdapterRegistry;
use crate::artifact::{ArtifactStore, BackupArtifact};
use crate::clock::SystemClock;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::event_log::{EventLog, EventRecord, RunRecord};
use crate::executor::{BackupExecutor, BackupReport};
use crate::notify::{NotificationDispatcher, NotificationEvent, NotificationMessage};
use crate::policy::resolver::{PolicyResolver, Resolved};
use crate::policy::{PolicyKey, PolicyStore};
use crate::process_guard::CancelFlag;
use crate::retention::{CleanupReport, RetentionCleaner};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::schedule::{EntryChange, ScheduleEntry, SchedulerConfigurator};
use crate::types::{BackendKind, BackupType, OperationKind, Severity};

/// Keys shown per environment in `status`
const ENVIRONMENT_KEYS: &[PolicyKey] = &[
    PolicyKey::Schedule,
    PolicyKey::CleanupSchedule,
    PolicyKey::BackupFrequency,
    PolicyKey::NotificationsEnabled,
    PolicyKey::NotificationsChannels,
];

/// Keys shown per service in `status`
const SERVICE_KEYS: &[PolicyKey] = &[
    PolicyKey::RetentionDays,
    PolicyKey::Compression,
    PolicyKey::CleanupEnabled,
    PolicyKey::DryRun,
    PolicyKey::BackupTypes,
    PolicyKey::TimeoutSeconds,
];

/// Number of event log records shown by `status`
const STATUS_EVENTS: usize = 10;

/// A finished run and the notification sent about it
#[derive(Debug)]
pub struct Completed<R> {
    pub report: R,
    pub notification: NotificationEvent,
}

/// Result of `test <environment>`
#[derive(Debug)]
pub struct DryTest {
    pub cleanup: CleanupReport,
    pub schedule: Vec<ScheduleEntry>,
}

#[derive(Debug)]
pub struct ServiceStatus {
    pub service: String,
    pub kind: BackendKind,
    pub policy: Vec<Resolved>,
    /// Newest artifact per backup type
    pub latest: Vec<BackupArtifact>,
}

#[derive(Debug)]
pub struct EnvironmentStatus {
    pub environment: String,
    pub policy: Vec<Resolved>,
    pub services: Vec<ServiceStatus>,
    pub events: Vec<EventRecord>,
}

impl EnvironmentStatus {
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("environment {}", self.environment)];
        for resolved in &self.policy {
            lines.push(format!(
                "  {:<24} {:<24} ({})",
                resolved.key.to_string(),
                resolved.value.to_string(),
                resolved.scope
            ));
        }
        for service in &self.services {
            lines.push(format!("  service {} [{}]", service.service, service.kind));
            for resolved in &service.policy {
                lines.push(format!(
                    "    {:<22} {:<24} ({})",
                    resolved.key.to_string(),
                    resolved.value.to_string(),
                    resolved.scope
                ));
            }
            if service.latest.is_empty() {
                lines.push("    no artifacts".to_string());
            }
            for artifact in &service.latest {
                lines.push(format!(
                    "    latest {:<15} {} {} bytes",
                    artifact.backup_type.to_string(),
                    artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
                    artifact.size_bytes
                ));
            }
        }
        if !self.events.is_empty() {
            lines.push("  recent events".to_string());
            lines.extend(self.events.iter().map(|e| format!("    {}", e.render())));
        }
        lines
    }
}

pub struct Engine {
    config: EngineConfig,
    policies: PolicyStore,
    registry: AdapterRegistry,
    store: Arc<ArtifactStore>,
    dispatcher: NotificationDispatcher,
    event_log: EventLog,
    cancel: CancelFlag,
}

impl Engine {
    /// Load configuration and policies from disk and wire the real runtime
    pub fn load(config_path: &Path, cancel: CancelFlag) -> Result<Self> {
        let config = EngineConfig::load(config_path)?;
        let policies = PolicyStore::load(&config.policies.retention, &config.policies.strategy)?;
        let store = Arc::new(ArtifactStore::new(config.backup_root.clone(), Arc::new(SystemClock)));
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerRuntime::new(config.runtime.program.clone(), cancel.clone()));
        let registry = AdapterRegistry::from_config(&config, runtime, store.clone());
        let dispatcher = NotificationDispatcher::from_config(&config.channels)?;
        Self::new(config, policies, registry, store, dispatcher, cancel)
    }

    /// Assemble an engine from parts, cross-checking policy against
    /// configuration.
    pub fn new(
        config: EngineConfig,
        policies: PolicyStore,
        registry: AdapterRegistry,
        store: Arc<ArtifactStore>,
        dispatcher: NotificationDispatcher,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let unknown_channels: Vec<String> = policies
            .referenced_channels()
            .into_iter()
            .filter(|id| !config.channels.contains_key(id))
            .collect();
        if !unknown_channels.is_empty() {
            return Err(EngineError::config(format!(
                "policy references unconfigured notification channel(s): {}",
                unknown_channels.join(", ")
            )));
        }

        for service in policies.service_names() {
            if !config.services.contains_key(service) {
                tracing::warn!(service, "policy overrides a service that is not configured");
            }
        }
        for environment in policies.environment_names() {
            if !config.environments.contains_key(environment) {
                tracing::warn!(environment, "policy overrides an environment that is not configured");
            }
        }

        let event_log = EventLog::new(config.event_log_path());
        Ok(Self {
            config,
            policies,
            registry,
            store,
            dispatcher,
            event_log,
            cancel,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> PolicyResolver<'_> {
        PolicyResolver::new(&self.policies)
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    /// `NotFound` unless the environment (and service) are configured
    pub fn ensure_target(&self, environment: &str, service: Option<&str>) -> Result<()> {
        match service {
            Some(service) => self.config.ensure_member(environment, service),
            None => self.config.services_for(environment).map(|_| ()),
        }
    }

    /// Human-readable summary of what was loaded (`validate`)
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![format!("backup root: {}", self.config.backup_root.display())];
        for (environment, env) in &self.config.environments {
            lines.push(format!("environment {}: {}", environment, env.services.join(", ")));
        }
        for (id, service) in &self.config.services {
            lines.push(format!("service {} [{}] container {}", id, service.backend.kind(), service.container));
        }
        if !self.config.channels.is_empty() {
            let ids: Vec<&str> = self.config.channels.keys().map(String::as_str).collect();
            lines.push(format!("channels: {}", ids.join(", ")));
        }
        lines
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    pub fn backup(
        &self,
        environment: &str,
        service: Option<&str>,
        backup_type: Option<BackupType>,
    ) -> Result<Completed<BackupReport>> {
        let executor = BackupExecutor::new(
            &self.config,
            &self.registry,
            self.resolver(),
            &self.store,
            self.cancel.clone(),
        );
        let report = executor.run_backup(environment, service, backup_type)?;

        self.record(EventRecord::Run(RunRecord::from_backup(&report, service)));
        let failures: Vec<String> = report
            .results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err())
            .map(ToString::to_string)
            .collect();
        let notification = self.notify(
            environment,
            OperationKind::Backup,
            Severity::from_counts(report.succeeded(), report.failed()),
            report.summary(),
            &failures,
        );
        Ok(Completed { report, notification })
    }

    pub fn cleanup(&self, environment: &str, service: Option<&str>) -> Result<Completed<CleanupReport>> {
        let report = self.cleaner().run_cleanup(environment, service, false)?;

        self.record(EventRecord::Run(RunRecord::from_cleanup(&report, service)));
        let failures: Vec<String> = report
            .results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err())
            .map(ToString::to_string)
            .collect();
        let notification = self.notify(
            environment,
            OperationKind::Cleanup,
            Severity::from_counts(report.succeeded(), report.failed()),
            report.summary(),
            &failures,
        );
        Ok(Completed { report, notification })
    }

    /// Forced dry-run cleanup plus the schedule entries `install` would write
    pub fn dry_test(&self, environment: &str, scheduler: &SchedulerConfigurator<'_>) -> Result<DryTest> {
        self.config.services_for(environment)?;
        let schedule = scheduler.plan(&self.resolver(), environment)?;
        let cleanup = self.cleaner().run_cleanup(environment, None, true)?;
        Ok(DryTest { cleanup, schedule })
    }

    fn cleaner(&self) -> RetentionCleaner<'_> {
        RetentionCleaner::new(
            &self.config,
            &self.registry,
            self.resolver(),
            &self.store,
            self.cancel.clone(),
        )
    }

    fn notify(
        &self,
        environment: &str,
        kind: OperationKind,
        severity: Severity,
        summary: String,
        failures: &[String],
    ) -> NotificationEvent {
        let mut body = summary;
        for failure in failures {
            body.push('\n');
            body.push_str(failure);
        }
        let message = NotificationMessage {
            environment: environment.to_string(),
            kind,
            severity,
            summary: body,
            timestamp: self.store.now(),
        };
        let event = self.dispatcher.notify(&self.resolver(), &message);
        if !event.channels_attempted.is_empty() {
            self.record(EventRecord::Notification(event.clone()));
        }
        event
    }

    /// Event log failures never fail a run
    fn record(&self, record: EventRecord) {
        if let Err(e) = self.event_log.append(&record) {
            tracing::warn!(path = %self.event_log.path().display(), error = %e, "cannot append to event log");
        }
    }

    // ------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------

    /// Resolved policy, newest artifacts and recent events
    pub fn status(&self, environment: Option<&str>) -> Result<Vec<EnvironmentStatus>> {
        let environments: Vec<String> = match environment {
            Some(env) => {
                self.config.services_for(env)?;
                vec![env.to_string()]
            }
            None => self.config.environment_names().map(String::from).collect(),
        };

        let resolver = self.resolver();
        let mut statuses = Vec::new();
        for environment in environments {
            let policy = resolver
                .effective(&environment, None)
                .into_iter()
                .filter(|r| ENVIRONMENT_KEYS.contains(&r.key))
                .collect();

            let mut services = Vec::new();
            for service in self.config.services_for(&environment)? {
                let adapter = self.registry.adapter_for(service)?;
                let policy = resolver
                    .effective(&environment, Some(service))
                    .into_iter()
                    .filter(|r| SERVICE_KEYS.contains(&r.key))
                    .collect();

                let mut latest: BTreeMap<BackupType, BackupArtifact> = BTreeMap::new();
                for artifact in self.store.list(&environment, Some(service))? {
                    let newer = latest
                        .get(&artifact.backup_type)
                        .is_none_or(|current| artifact.created_at > current.created_at);
                    if newer {
                        latest.insert(artifact.backup_type, artifact);
                    }
                }

                services.push(ServiceStatus {
                    service: service.clone(),
                    kind: adapter.kind(),
                    policy,
                    latest: latest.into_values().collect(),
                });
            }

            let events = self.event_log.read_recent(STATUS_EVENTS, Some(&environment))?;
            statuses.push(EnvironmentStatus {
                environment,
                policy,
                services,
                events,
            });
        }
        Ok(statuses)
    }

    /// Every artifact of an environment, newest first within each service
    pub fn list(&self, environment: &str) -> Result<Vec<BackupArtifact>> {
        let order = self.config.services_for(environment)?;
        let mut artifacts = self.store.list(environment, None)?;
        artifacts.sort_by(|a, b| {
            let rank = |s: &str| order.iter().position(|o| o == s).unwrap_or(usize::MAX);
            rank(&a.service)
                .cmp(&rank(&b.service))
                .then_with(|| a.service.cmp(&b.service))
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.backup_type.cmp(&b.backup_type))
        });
        Ok(artifacts)
    }

    // ------------------------------------------------------------------
    // Schedule
    // ------------------------------------------------------------------

    pub fn schedule_list(&self, scheduler: &SchedulerConfigurator<'_>) -> Result<Vec<ScheduleEntry>> {
        Ok(scheduler.list()?)
    }

    pub fn schedule_install(
        &self,
        scheduler: &SchedulerConfigurator<'_>,
        environment: &str,
    ) -> Result<Vec<(ScheduleEntry, EntryChange)>> {
        self.config.services_for(environment)?;
        Ok(scheduler.install(&self.resolver(), environment)?)
    }

    pub fn schedule_remove(&self, scheduler: &SchedulerConfigurator<'_>, environment: Option<&str>) -> Result<usize> {
        if let Some(environment) = environment {
            self.config.services_for(environment)?;
        }
        Ok(scheduler.remove(environment)?)
    }
}
