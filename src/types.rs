//! Type-safe vocabulary for stackkeeper
//!
//! Backend categories, backup types, operation kinds and severities are
//! proper Rust enums with stable string tokens, so policy documents, file
//! names and CLI arguments all parse into the same closed set of values.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Storage-service category served by one adapter implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackendKind {
    /// Relational database (PostgreSQL)
    Relational,
    /// In-memory key/value cache (Redis)
    Cache,
    /// Vector database (Qdrant)
    Vector,
    /// S3-compatible object store (MinIO)
    Object,
    /// Model-serving cache (Ollama)
    ModelCache,
}

/// Kind of backup an adapter can produce.
///
/// The string token doubles as the directory name and the middle part of
/// the artifact file name, so it must never contain an underscore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackupType {
    /// Complete logical dump
    Full,
    /// Structure only
    Schema,
    /// Rows only
    Data,
    /// Point-in-time dump of an in-memory store
    Snapshot,
    /// Durable write log, best effort
    AppendLog,
    /// Per-collection export
    Collection,
    /// Service configuration / topology metadata
    Config,
    /// Full data tree archive
    Bucket,
    /// Cached model and weight files
    Artifacts,
}

impl BackupType {
    /// File extension of the uncompressed artifact
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Full | Self::Schema | Self::Data => "sql",
            Self::Snapshot => "rdb",
            Self::AppendLog | Self::Collection | Self::Config | Self::Bucket | Self::Artifacts => {
                "tar"
            }
        }
    }
}

/// Which engine operation produced an event or schedule entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Cleanup,
}

/// Notification severity derived from a run's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    /// Nothing failed
    Info,
    /// Some targets failed
    Warning,
    /// Every target failed
    Critical,
}

impl Severity {
    /// Map succeeded/failed counts to a severity
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => Self::Info,
            (0, _) => Self::Critical,
            _ => Self::Warning,
        }
    }
}

/// Policy scope a resolved value was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Scope {
    Service,
    Environment,
    Global,
    BuiltIn,
}

/// Is `name` usable as an environment name or service identifier?
///
/// Both end up as path components and crontab markers, so they are limited
/// to `[a-z0-9][a-z0-9-]*`. Underscores are excluded because the artifact
/// file name uses them as separators.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_backup_type_tokens() {
        assert_eq!(BackupType::AppendLog.to_string(), "append-log");
        assert_eq!(BackupType::from_str("append-log").ok(), Some(BackupType::AppendLog));
        assert!(BackupType::from_str("append_log").is_err());
        for ty in BackupType::iter() {
            assert!(!ty.to_string().contains('_'), "{ty} must not contain '_'");
        }
    }

    #[test]
    fn test_backend_kind_serde_matches_display() {
        for kind in BackendKind::iter() {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
        assert_eq!(BackendKind::ModelCache.to_string(), "model-cache");
    }

    #[test]
    fn test_severity_from_counts() {
        assert_eq!(Severity::from_counts(3, 0), Severity::Info);
        assert_eq!(Severity::from_counts(0, 0), Severity::Info);
        assert_eq!(Severity::from_counts(2, 1), Severity::Warning);
        assert_eq!(Severity::from_counts(0, 2), Severity::Critical);
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("production"));
        assert!(is_valid_identifier("relational-store"));
        assert!(is_valid_identifier("env2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("-prod"));
        assert!(!is_valid_identifier("Prod"));
        assert!(!is_valid_identifier("cache_store"));
        assert!(!is_valid_identifier("a/b"));
    }
}
