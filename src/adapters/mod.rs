//! Backend adapters and their registry.
//!
//! # Design
//!
//! Every stateful service is reached through one [`Adapter`] that knows how
//! to back it up and how to expire its ephemeral data. Adapters share the
//! plumbing in [`Backend`]: container name templating, reachability probes,
//! deadline accounting and the partial-then-rename artifact write. The
//! registry maps service identifiers to adapters; an unknown identifier is
//! a typed `NotFound`, never a silent skip.
//!
//! | Kind          | Backup types                  | Cleanup                          |
//! |---------------|-------------------------------|----------------------------------|
//! | `relational`  | `full`, `schema`, `data`      | expire rows of ephemeral tables  |
//! | `cache`       | `snapshot`, `append-log`      | TTL keys that never expire       |
//! | `vector`      | `collection`, `config`        | drop stale dated collections     |
//! | `object`      | `bucket`, `config`            | delete old temporary objects     |
//! | `model-cache` | `artifacts`, `config`         | delete old cache files           |

pub mod cache;
mod listing;
pub mod model_cache;
pub mod object;
pub mod relational;
pub mod vector;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::artifact::{ArtifactStore, BackupArtifact};
use crate::command::AdminCommand;
use crate::config::{BackendConfig, EngineConfig};
use crate::error::{BackupError, CleanupError, EngineError, RuntimeError};
use crate::retention::{RetentionRun, RetentionTarget};
use crate::runtime::{CommandOutput, ContainerRuntime};
use crate::types::{BackendKind, BackupType};

pub use cache::CacheAdapter;
pub use model_cache::ModelCacheAdapter;
pub use object::ObjectAdapter;
pub use relational::RelationalAdapter;
pub use vector::VectorAdapter;

/// Environment and time budget of one service operation.
///
/// The budget covers every command the operation issues, not each one
/// separately.
#[derive(Debug, Clone)]
pub struct Target<'a> {
    pub environment: &'a str,
    budget: Duration,
    deadline: Instant,
}

impl<'a> Target<'a> {
    pub fn new(environment: &'a str, budget: Duration) -> Self {
        Self {
            environment,
            budget,
            deadline: Instant::now() + budget,
        }
    }

    /// Time left before the budget is exhausted
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Report timeouts against the whole budget rather than the remainder
    fn budget_error(&self, err: RuntimeError) -> RuntimeError {
        match err {
            RuntimeError::TimedOut { command, .. } => RuntimeError::TimedOut {
                command,
                after: self.budget,
            },
            other => other,
        }
    }
}

/// Backup/cleanup contract shared by all backends
pub trait Adapter: Send + Sync {
    fn service(&self) -> &str;

    fn kind(&self) -> BackendKind;

    fn supported_backup_types(&self) -> &'static [BackupType];

    /// Types produced when neither the caller nor policy names any
    fn default_backup_types(&self) -> &'static [BackupType];

    fn backup(&self, target: &Target<'_>, backup_type: BackupType) -> Result<BackupArtifact, BackupError>;

    fn cleanup(
        &self,
        target: &Target<'_>,
        age_threshold_days: u32,
        dry_run: bool,
    ) -> Result<RetentionRun, CleanupError>;
}

/// `UnsupportedBackupType` unless `adapter` offers `backup_type`
pub fn ensure_supported(adapter: &dyn Adapter, backup_type: BackupType) -> Result<(), BackupError> {
    if adapter.supported_backup_types().contains(&backup_type) {
        Ok(())
    } else {
        Err(BackupError::UnsupportedBackupType {
            service: adapter.service().to_string(),
            requested: backup_type.to_string(),
            supported: adapter
                .supported_backup_types()
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }
}

// ============================================================================
// Shared plumbing
// ============================================================================

/// Connection of one adapter to its container and the artifact store
pub struct Backend {
    service: String,
    container_template: String,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ArtifactStore>,
}

impl Backend {
    pub fn new(
        service: impl Into<String>,
        container_template: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            service: service.into(),
            container_template: container_template.into(),
            runtime,
            store,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn container(&self, environment: &str) -> String {
        self.container_template.replace("{env}", environment)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.store.now()
    }

    fn exec(&self, target: &Target<'_>, command: &dyn AdminCommand) -> Result<CommandOutput, RuntimeError> {
        tracing::debug!(service = %self.service, command = %command.describe(), "exec");
        self.runtime
            .exec(&self.container(target.environment), command, target.remaining())
            .map_err(|e| target.budget_error(e))
    }

    pub fn backup_probe(&self, target: &Target<'_>) -> Result<(), BackupError> {
        self.runtime
            .is_reachable(&self.container(target.environment))
            .map_err(|e| BackupError::from_runtime(&self.service, e))
    }

    pub fn cleanup_probe(&self, target: &Target<'_>) -> Result<(), CleanupError> {
        self.runtime
            .is_reachable(&self.container(target.environment))
            .map_err(|e| CleanupError::from_runtime(&self.service, e))
    }

    pub fn backup_exec(
        &self,
        target: &Target<'_>,
        command: &dyn AdminCommand,
    ) -> Result<CommandOutput, BackupError> {
        self.exec(target, command)
            .map_err(|e| BackupError::from_runtime(&self.service, e))
    }

    pub fn cleanup_exec(
        &self,
        target: &Target<'_>,
        command: &dyn AdminCommand,
    ) -> Result<CommandOutput, CleanupError> {
        self.exec(target, command)
            .map_err(|e| CleanupError::from_runtime(&self.service, e))
    }

    /// Stream a command's stdout into a new artifact.
    ///
    /// The artifact only appears under its final name once the command
    /// succeeded and produced output.
    pub fn stream_artifact(
        &self,
        target: &Target<'_>,
        backup_type: BackupType,
        command: &dyn AdminCommand,
    ) -> Result<BackupArtifact, BackupError> {
        let io_error = |source| BackupError::Io {
            service: self.service.clone(),
            source,
        };

        let pending = self
            .store
            .begin(target.environment, &self.service, backup_type)
            .map_err(io_error)?;

        tracing::debug!(service = %self.service, command = %command.describe(), "streaming artifact");
        let written = self
            .runtime
            .exec_to_file(
                &self.container(target.environment),
                command,
                pending.path(),
                target.remaining(),
            )
            .map_err(|e| BackupError::from_runtime(&self.service, target.budget_error(e)))?;

        if written == 0 {
            return Err(BackupError::command(
                &self.service,
                format!("{} produced no output", command.program()),
            ));
        }

        pending.commit().map_err(io_error)
    }

    /// Empty backend retention run stamped now
    pub fn retention_run(&self, target: &Target<'_>, age_threshold_days: u32, dry_run: bool) -> RetentionRun {
        RetentionRun::new(
            target.environment,
            &self.service,
            RetentionTarget::Backend,
            self.now(),
            age_threshold_days,
            dry_run,
        )
    }
}

/// Parse a single integer reply line
pub(crate) fn parse_count(service: &str, stdout: &str) -> Result<u64, CleanupError> {
    let line = stdout.trim();
    line.parse()
        .map_err(|_| CleanupError::failed(service, format!("unexpected command output '{}'", line)))
}

// ============================================================================
// Registry
// ============================================================================

/// Service identifier → adapter
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Box<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one adapter per configured service
    pub fn from_config(
        config: &EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<ArtifactStore>,
    ) -> Self {
        let mut registry = Self::new();
        for (id, service) in &config.services {
            let backend = Backend::new(id, &service.container, runtime.clone(), store.clone());
            let adapter: Box<dyn Adapter> = match &service.backend {
                BackendConfig::Relational(cfg) => Box::new(RelationalAdapter::new(backend, cfg.clone())),
                BackendConfig::Cache(cfg) => Box::new(CacheAdapter::new(backend, cfg.clone())),
                BackendConfig::Vector(cfg) => Box::new(VectorAdapter::new(backend, cfg.clone())),
                BackendConfig::Object(cfg) => Box::new(ObjectAdapter::new(backend, cfg.clone())),
                BackendConfig::ModelCache(cfg) => Box::new(ModelCacheAdapter::new(backend, cfg.clone())),
            };
            registry.register(adapter);
        }
        registry
    }

    /// Add or replace the adapter for its service
    pub fn register(&mut self, adapter: Box<dyn Adapter>) {
        self.adapters.insert(adapter.service().to_string(), adapter);
    }

    pub fn adapter_for(&self, service: &str) -> Result<&dyn Adapter, EngineError> {
        self.adapters
            .get(service)
            .map(|adapter| adapter.as_ref())
            .ok_or_else(|| EngineError::not_found(format!("no adapter registered for service '{}'", service)))
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::commands::fs::CatArgs;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_container_template() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _) = backend(Arc::new(ScriptedRuntime::default()), dir.path(), now());
        assert_eq!(backend.container("staging"), "stack-staging-svc");
    }

    #[test]
    fn test_failed_stream_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.fail("disk full");
        let (backend, store) = backend(runtime, dir.path(), now());

        let cat = CatArgs { path: "/data/dump.rdb".to_string() };
        let err = backend
            .stream_artifact(&Target::new("production", Duration::from_secs(60)), BackupType::Snapshot, &cat)
            .unwrap_err();
        assert!(matches!(err, BackupError::CommandFailed { .. }));

        let type_dir = store.type_dir("production", "svc", BackupType::Snapshot);
        assert_eq!(std::fs::read_dir(type_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_output_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.reply("");
        let (backend, store) = backend(runtime, dir.path(), now());

        let cat = CatArgs { path: "/data/dump.rdb".to_string() };
        assert!(backend
            .stream_artifact(&Target::new("production", Duration::from_secs(60)), BackupType::Snapshot, &cat)
            .is_err());
        assert!(store.list("production", None).unwrap().is_empty());
    }

    #[test]
    fn test_registry_unknown_service() {
        let registry = AdapterRegistry::new();
        assert!(matches!(registry.adapter_for("search"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_target_budget() {
        let target = Target::new("production", Duration::from_secs(0));
        assert_eq!(target.remaining(), Duration::ZERO);
        let err = target.budget_error(RuntimeError::TimedOut {
            command: "pg_dump".to_string(),
            after: Duration::ZERO,
        });
        assert!(matches!(err, RuntimeError::TimedOut { after, .. } if after == Duration::from_secs(0)));
    }
}
