//! Engine configuration (`stackkeeper.yaml`).
//!
//! Describes the deployment the engine operates on: where artifacts live,
//! which container runtime to drive, which services each environment runs
//! and how each backend is reached. Policy (how long, how often) lives in
//! the separate policy documents referenced from here.
//!
//! ```yaml
//! backup_root: /var/backups/stack
//! runtime: { program: docker }
//! policies:
//!   retention: retention-policy.yaml
//!   strategy: backup-strategy.yaml
//! environments:
//!   production:
//!     services: [relational-store, cache-store]
//! services:
//!   relational-store:
//!     kind: relational
//!     container: "stack-{env}-postgres"
//!     password_env: POSTGRES_PASSWORD
//! channels:
//!   ops-chat: { kind: chat, url: "https://chat.example/hooks/abc" }
//! ```
//!
//! Relative paths resolve against the directory of the configuration file.
//! Everything is validated when loaded; nothing is touched before that.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::commands::postgres::is_sql_identifier;
use crate::error::{EngineError, Result};
use crate::types::{BackendKind, is_valid_identifier};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "STACKKEEPER_CONFIG";

/// Environment variable overriding `backup_root`
pub const BACKUP_ROOT_ENV: &str = "STACKKEEPER_BACKUP_ROOT";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/stackkeeper/stackkeeper.yaml";

const EVENT_LOG_FILE: &str = "events.jsonl";

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub backup_root: PathBuf,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub policies: PolicyPaths,
    #[serde(default)]
    pub event_log: Option<PathBuf>,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_program")]
    pub program: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: default_runtime_program(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyPaths {
    pub retention: PathBuf,
    pub strategy: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Services in processing order
    pub services: Vec<String>,
}

/// One stateful service
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Container name; `{env}` is replaced by the environment name
    pub container: String,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

/// Backend category and its parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendConfig {
    Relational(RelationalConfig),
    Cache(CacheConfig),
    Vector(VectorConfig),
    Object(ObjectConfig),
    ModelCache(ModelCacheConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Relational(_) => BackendKind::Relational,
            Self::Cache(_) => BackendKind::Cache,
            Self::Vector(_) => BackendKind::Vector,
            Self::Object(_) => BackendKind::Object,
            Self::ModelCache(_) => BackendKind::ModelCache,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelationalConfig {
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default = "default_pg_database")]
    pub database: String,
    /// Host environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "default_ephemeral_tables")]
    pub ephemeral_tables: Vec<EphemeralTable>,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            user: default_pg_user(),
            database: default_pg_database(),
            password_env: None,
            ephemeral_tables: default_ephemeral_tables(),
        }
    }
}

/// Table whose rows expire by a timestamp column
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EphemeralTable {
    pub table: String,
    #[serde(default = "default_timestamp_column")]
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_rdb_file")]
    pub rdb_file: String,
    /// Key prefixes scanned by cleanup
    #[serde(default = "default_cache_namespaces")]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_cache_data_dir(),
            rdb_file: default_rdb_file(),
            namespaces: default_cache_namespaces(),
            password_env: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "default_vector_api")]
    pub api_url: String,
    #[serde(default = "default_vector_snapshots")]
    pub snapshots_dir: String,
    #[serde(default = "default_vector_config_dir")]
    pub config_dir: String,
    #[serde(default = "default_stale_prefixes")]
    pub stale_prefixes: Vec<String>,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            api_url: default_vector_api(),
            snapshots_dir: default_vector_snapshots(),
            config_dir: default_vector_config_dir(),
            stale_prefixes: default_stale_prefixes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectConfig {
    #[serde(default = "default_object_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_object_config_dir")]
    pub config_dir: String,
    /// Per-bucket prefixes whose files expire
    #[serde(default = "default_object_prefixes")]
    pub ephemeral_prefixes: Vec<String>,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            data_dir: default_object_data_dir(),
            config_dir: default_object_config_dir(),
            ephemeral_prefixes: default_object_prefixes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelCacheConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    #[serde(default = "default_model_config_dir")]
    pub config_dir: String,
    #[serde(default = "default_model_cache_dir")]
    pub cache_dir: String,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            config_dir: default_model_config_dir(),
            cache_dir: default_model_cache_dir(),
        }
    }
}

/// Notification channel definition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChannelConfig {
    /// JSON event body
    Webhook { url: String },
    /// `{"text": ...}` body
    Chat { url: String },
    /// Message piped to a `sendmail -t` compatible binary
    Email {
        to: Vec<String>,
        #[serde(default)]
        from: Option<String>,
        #[serde(default = "default_sendmail")]
        sendmail: PathBuf,
    },
}

fn default_runtime_program() -> String {
    "docker".to_string()
}
fn default_pg_user() -> String {
    "postgres".to_string()
}
fn default_pg_database() -> String {
    "postgres".to_string()
}
fn default_timestamp_column() -> String {
    "created_at".to_string()
}
fn default_ephemeral_tables() -> Vec<EphemeralTable> {
    ["logs", "sessions"]
        .into_iter()
        .map(|table| EphemeralTable {
            table: table.to_string(),
            column: default_timestamp_column(),
        })
        .collect()
}
fn default_cache_data_dir() -> String {
    "/data".to_string()
}
fn default_rdb_file() -> String {
    "dump.rdb".to_string()
}
fn default_cache_namespaces() -> Vec<String> {
    vec!["cache:".to_string(), "session:".to_string()]
}
fn default_vector_api() -> String {
    "http://localhost:6333".to_string()
}
fn default_vector_snapshots() -> String {
    "/qdrant/snapshots".to_string()
}
fn default_vector_config_dir() -> String {
    "/qdrant/config".to_string()
}
fn default_stale_prefixes() -> Vec<String> {
    vec!["tmp_".to_string(), "temp_".to_string(), "test_".to_string()]
}
fn default_object_data_dir() -> String {
    "/data".to_string()
}
fn default_object_config_dir() -> String {
    "/data/.minio.sys/config".to_string()
}
fn default_object_prefixes() -> Vec<String> {
    vec!["tmp".to_string(), "logs".to_string()]
}
fn default_models_dir() -> String {
    "/root/.ollama/models".to_string()
}
fn default_model_config_dir() -> String {
    "/root/.ollama".to_string()
}
fn default_model_cache_dir() -> String {
    "/root/.ollama/cache".to_string()
}
fn default_sendmail() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

/// Read a password from the host environment variable named by `var`
pub fn secret_from_env(var: Option<&str>) -> Option<String> {
    let var = var?;
    match std::env::var(var) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = var, "password variable is not set, connecting without it");
            None
        }
    }
}

impl EngineConfig {
    /// Load, resolve and validate a configuration file.
    ///
    /// `STACKKEEPER_BACKUP_ROOT` overrides `backup_root`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut config = Self::from_yaml(&text, base_dir)?;

        if let Ok(root) = std::env::var(BACKUP_ROOT_ENV) {
            if root.trim().is_empty() {
                return Err(EngineError::config(format!("{} is set but empty", BACKUP_ROOT_ENV)));
            }
            tracing::debug!(backup_root = %root, "backup root overridden from environment");
            config.backup_root = PathBuf::from(root);
        }

        Ok(config)
    }

    /// Parse YAML text; relative paths resolve against `base_dir`.
    pub fn from_yaml(text: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(text)
            .map_err(|e| EngineError::config(format!("stackkeeper configuration: {}", e)))?;

        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };
        config.backup_root = resolve(&config.backup_root);
        config.policies.retention = resolve(&config.policies.retention);
        config.policies.strategy = resolve(&config.policies.strategy);
        config.event_log = config.event_log.as_deref().map(resolve);

        config.validate()?;
        Ok(config)
    }

    /// Structural validation; every violation is `ConfigInvalid`
    pub fn validate(&self) -> Result<()> {
        if self.runtime.program.trim().is_empty() {
            return Err(EngineError::config("runtime.program must not be empty"));
        }
        if self.environments.is_empty() {
            return Err(EngineError::config("at least one environment must be configured"));
        }

        for (name, env) in &self.environments {
            if !is_valid_identifier(name) {
                return Err(EngineError::config(format!(
                    "environment name '{}' must match [a-z0-9][a-z0-9-]*",
                    name
                )));
            }
            let mut seen = BTreeSet::new();
            for service in &env.services {
                if !self.services.contains_key(service) {
                    return Err(EngineError::config(format!(
                        "environment '{}' lists unknown service '{}'",
                        name, service
                    )));
                }
                if !seen.insert(service) {
                    return Err(EngineError::config(format!(
                        "environment '{}' lists service '{}' twice",
                        name, service
                    )));
                }
            }
        }

        for (id, service) in &self.services {
            if !is_valid_identifier(id) {
                return Err(EngineError::config(format!(
                    "service identifier '{}' must match [a-z0-9][a-z0-9-]*",
                    id
                )));
            }
            validate_container_template(id, &service.container)?;
            validate_backend(id, &service.backend)?;
        }

        for (id, channel) in &self.channels {
            if !is_valid_identifier(id) {
                return Err(EngineError::config(format!(
                    "channel identifier '{}' must match [a-z0-9][a-z0-9-]*",
                    id
                )));
            }
            match channel {
                ChannelConfig::Webhook { url } | ChannelConfig::Chat { url } => {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        return Err(EngineError::config(format!(
                            "channel '{}': url must start with http:// or https://",
                            id
                        )));
                    }
                }
                ChannelConfig::Email { to, from, .. } => {
                    if to.is_empty() || !to.iter().all(|addr| is_mail_address(addr)) {
                        return Err(EngineError::config(format!(
                            "channel '{}': 'to' must list one or more addresses of the form local@domain",
                            id
                        )));
                    }
                    if from.as_deref().is_some_and(|addr| !is_mail_address(addr)) {
                        return Err(EngineError::config(format!(
                            "channel '{}': 'from' must be an address of the form local@domain",
                            id
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Services of an environment in processing order
    pub fn services_for(&self, environment: &str) -> Result<&[String]> {
        self.environments
            .get(environment)
            .map(|env| env.services.as_slice())
            .ok_or_else(|| EngineError::not_found(format!("unknown environment '{}'", environment)))
    }

    /// Check that `service` is part of `environment`
    pub fn ensure_member(&self, environment: &str, service: &str) -> Result<()> {
        let services = self.services_for(environment)?;
        if !self.services.contains_key(service) {
            return Err(EngineError::not_found(format!("unknown service '{}'", service)));
        }
        if !services.iter().any(|s| s == service) {
            return Err(EngineError::not_found(format!(
                "service '{}' is not part of environment '{}'",
                service, environment
            )));
        }
        Ok(())
    }

    pub fn environment_names(&self) -> impl Iterator<Item = &str> {
        self.environments.keys().map(String::as_str)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.event_log
            .clone()
            .unwrap_or_else(|| self.backup_root.join(EVENT_LOG_FILE))
    }
}

/// `local@domain`, both parts non-empty, no whitespace
fn is_mail_address(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !addr.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn validate_container_template(service: &str, template: &str) -> Result<()> {
    let rendered = template.replace("{env}", "env");
    let valid = !rendered.is_empty()
        && rendered
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::config(format!(
            "service '{}': container '{}' may only contain letters, digits, '-', '_', '.' and {{env}}",
            service, template
        )))
    }
}

fn validate_backend(service: &str, backend: &BackendConfig) -> Result<()> {
    let invalid = |msg: String| Err(EngineError::config(format!("service '{}': {}", service, msg)));

    match backend {
        BackendConfig::Relational(cfg) => {
            for table in &cfg.ephemeral_tables {
                if !is_sql_identifier(&table.table) || !is_sql_identifier(&table.column) {
                    return invalid(format!(
                        "ephemeral table '{}.{}' is not a plain SQL identifier",
                        table.table, table.column
                    ));
                }
            }
        }
        BackendConfig::Cache(cfg) => {
            absolute(&cfg.data_dir).or_else(invalid)?;
            if cfg.rdb_file.is_empty() || cfg.rdb_file.contains('/') {
                return invalid(format!("rdb_file '{}' must be a bare file name", cfg.rdb_file));
            }
            for ns in &cfg.namespaces {
                if ns.is_empty() || ns.contains(['*', '?', '[', ']', '\\']) {
                    return invalid(format!("cache namespace '{}' must be a literal prefix", ns));
                }
            }
        }
        BackendConfig::Vector(cfg) => {
            if !cfg.api_url.starts_with("http://") && !cfg.api_url.starts_with("https://") {
                return invalid(format!("api_url '{}' must be an http(s) URL", cfg.api_url));
            }
            absolute(&cfg.snapshots_dir).or_else(invalid)?;
            absolute(&cfg.config_dir).or_else(invalid)?;
            if cfg.stale_prefixes.iter().any(String::is_empty) {
                return invalid("stale prefixes must not be empty".to_string());
            }
        }
        BackendConfig::Object(cfg) => {
            absolute(&cfg.data_dir).or_else(invalid)?;
            absolute(&cfg.config_dir).or_else(invalid)?;
            for prefix in &cfg.ephemeral_prefixes {
                let plain = !prefix.is_empty()
                    && prefix != "."
                    && prefix != ".."
                    && !prefix.contains(['/', '*', '?', '[', ']']);
                if !plain {
                    return invalid(format!("ephemeral prefix '{}' must be a single path segment", prefix));
                }
            }
        }
        BackendConfig::ModelCache(cfg) => {
            absolute(&cfg.models_dir).or_else(invalid)?;
            absolute(&cfg.config_dir).or_else(invalid)?;
            absolute(&cfg.cache_dir).or_else(invalid)?;
        }
    }
    Ok(())
}

fn absolute(path: &str) -> std::result::Result<(), String> {
    if path.starts_with('/') && !path.split('/').any(|part| part == "..") {
        Ok(())
    } else {
        Err(format!("'{}' must be an absolute in-container path", path))
    }
}
