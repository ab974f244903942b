//! Declarative backup/retention policy documents.
//!
//! Two YAML documents (retention policy and backup strategy) share one
//! layout:
//!
//! ```yaml
//! global:        { retention_days: 7, compression: true }
//! environments:
//!   production:  { retention_days: 14, notifications: { enabled: true } }
//! services:
//!   relational-store: { retention_days: 30 }
//! ```
//!
//! # Design
//!
//! - **Validate at load**: every value is type-checked when the document is
//!   read, so resolution can never fail later.
//! - **Flattened keys**: nested mappings become dotted keys
//!   (`notifications.enabled`).
//! - **Unknown keys warn**: attributes this engine does not understand are
//!   logged and ignored so that documents shared with other tooling keep
//!   loading.
//! - **Merged store**: both documents fold into one [`PolicyStore`]; the
//!   same key set to different values in the same scope is rejected.

pub mod resolver;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};
use serde_yaml::{Mapping, Value};
use strum::{Display, EnumIter, EnumString};

use crate::cron::CronExpression;
use crate::error::{EngineError, Result};
use crate::types::{is_valid_identifier, BackupType};

pub use resolver::{PolicyResolver, Resolved};

// ============================================================================
// Keys and values
// ============================================================================

/// Attribute keys understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum PolicyKey {
    RetentionDays,
    BackupFrequency,
    Compression,
    CleanupEnabled,
    DryRun,
    Schedule,
    CleanupSchedule,
    BackupTypes,
    TimeoutSeconds,
    #[strum(serialize = "notifications.enabled")]
    NotificationsEnabled,
    #[strum(serialize = "notifications.channels")]
    NotificationsChannels,
}

impl Serialize for PolicyKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Shape a key's value must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Integer,
    PositiveInteger,
    Bool,
    Token,
    Cron,
    IdentifierList,
    BackupTypeList,
}

impl PolicyKey {
    fn value_kind(&self) -> ValueKind {
        match self {
            Self::RetentionDays => ValueKind::Integer,
            Self::TimeoutSeconds => ValueKind::PositiveInteger,
            Self::Compression | Self::CleanupEnabled | Self::DryRun | Self::NotificationsEnabled => {
                ValueKind::Bool
            }
            Self::BackupFrequency => ValueKind::Token,
            Self::Schedule | Self::CleanupSchedule => ValueKind::Cron,
            Self::NotificationsChannels => ValueKind::IdentifierList,
            Self::BackupTypes => ValueKind::BackupTypeList,
        }
    }

    /// Built-in constant used when no scope defines the key
    pub fn builtin(&self) -> PolicyValue {
        match self {
            Self::RetentionDays => PolicyValue::Integer(30),
            Self::BackupFrequency => PolicyValue::Text("daily".to_string()),
            Self::Compression => PolicyValue::Bool(true),
            Self::CleanupEnabled => PolicyValue::Bool(true),
            Self::DryRun => PolicyValue::Bool(false),
            Self::Schedule => PolicyValue::Text("0 2 * * *".to_string()),
            Self::CleanupSchedule => PolicyValue::Text("0 3 * * *".to_string()),
            Self::BackupTypes => PolicyValue::List(Vec::new()),
            Self::TimeoutSeconds => PolicyValue::Integer(1800),
            Self::NotificationsEnabled => PolicyValue::Bool(false),
            Self::NotificationsChannels => PolicyValue::List(Vec::new()),
        }
    }
}

/// A validated attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PolicyValue {
    Bool(bool),
    Integer(u64),
    Text(String),
    List(Vec<String>),
}

impl PolicyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for PolicyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
            Self::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// Attributes of one scope
pub type Attributes = BTreeMap<PolicyKey, PolicyValue>;

// ============================================================================
// Documents
// ============================================================================

/// One parsed and validated policy document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyDocument {
    pub global: Attributes,
    pub environments: BTreeMap<String, Attributes>,
    pub services: BTreeMap<String, Attributes>,
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    global: Option<Mapping>,
    #[serde(default)]
    environments: Option<BTreeMap<String, Option<Mapping>>>,
    #[serde(default)]
    services: Option<BTreeMap<String, Option<Mapping>>>,
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

impl PolicyDocument {
    /// Parse a YAML policy document.
    ///
    /// `origin` names the document in error messages (usually its file name).
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        let raw: RawDocument = serde_yaml::from_str(text)
            .map_err(|e| EngineError::config(format!("{}: {}", origin, e)))?;

        for section in raw.other.keys() {
            tracing::warn!(origin, section = %section, "ignoring unknown policy section");
        }

        let mut document = PolicyDocument::default();

        if let Some(global) = raw.global {
            document.global = parse_attributes(&global, "global", origin)?;
        }

        for (name, attrs) in raw.environments.unwrap_or_default() {
            check_scope_name(&name, "environments", origin)?;
            let label = format!("environments.{}", name);
            let parsed = match attrs {
                Some(mapping) => parse_attributes(&mapping, &label, origin)?,
                None => Attributes::new(),
            };
            document.environments.insert(name, parsed);
        }

        for (name, attrs) in raw.services.unwrap_or_default() {
            check_scope_name(&name, "services", origin)?;
            let label = format!("services.{}", name);
            let parsed = match attrs {
                Some(mapping) => parse_attributes(&mapping, &label, origin)?,
                None => Attributes::new(),
            };
            document.services.insert(name, parsed);
        }

        Ok(document)
    }

    /// Read and parse a policy document from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let origin = path.display().to_string();
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("cannot read policy document {}: {}", origin, e)))?;
        Self::parse(&text, &origin)
    }
}

fn check_scope_name(name: &str, section: &str, origin: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(EngineError::config(format!(
            "{}: invalid name '{}' in {} (expected [a-z0-9][a-z0-9-]*)",
            origin, name, section
        )))
    }
}

fn parse_attributes(mapping: &Mapping, label: &str, origin: &str) -> Result<Attributes> {
    let mut flat = Vec::new();
    flatten("", mapping, &mut flat).map_err(|reason| {
        EngineError::config(format!("{}: {}: {}", origin, label, reason))
    })?;

    let mut attributes = Attributes::new();
    for (name, value) in flat {
        let Ok(key) = PolicyKey::from_str(&name) else {
            tracing::warn!(origin, scope = label, key = %name, "ignoring unknown policy key");
            continue;
        };
        let parsed = parse_value(key, &value).map_err(|reason| {
            EngineError::config(format!("{}: {}.{}: {}", origin, label, name, reason))
        })?;
        attributes.insert(key, parsed);
    }
    Ok(attributes)
}

fn flatten(prefix: &str, mapping: &Mapping, out: &mut Vec<(String, Value)>) -> std::result::Result<(), String> {
    for (key, value) in mapping {
        let Some(key) = key.as_str() else {
            return Err(format!("non-string key {:?}", key));
        };
        let full = if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Mapping(nested) => flatten(&full, nested, out)?,
            other => out.push((full, other.clone())),
        }
    }
    Ok(())
}

fn parse_value(key: PolicyKey, value: &Value) -> std::result::Result<PolicyValue, String> {
    match key.value_kind() {
        ValueKind::Integer => value
            .as_u64()
            .map(PolicyValue::Integer)
            .ok_or_else(|| format!("expected a non-negative integer, found {}", describe(value))),
        ValueKind::PositiveInteger => match value.as_u64() {
            Some(n) if n > 0 => Ok(PolicyValue::Integer(n)),
            _ => Err(format!("expected a positive integer, found {}", describe(value))),
        },
        ValueKind::Bool => value
            .as_bool()
            .map(PolicyValue::Bool)
            .ok_or_else(|| format!("expected true or false, found {}", describe(value))),
        ValueKind::Token => match value.as_str() {
            Some(s) if is_token(s) => Ok(PolicyValue::Text(s.to_string())),
            _ => Err(format!("expected a lowercase token, found {}", describe(value))),
        },
        ValueKind::Cron => {
            let text = value
                .as_str()
                .ok_or_else(|| format!("expected a cron expression, found {}", describe(value)))?;
            let expr = CronExpression::parse(text)?;
            Ok(PolicyValue::Text(expr.as_str().to_string()))
        }
        ValueKind::IdentifierList => {
            let items = string_list(value)?;
            if let Some(bad) = items.iter().find(|i| !is_valid_identifier(i)) {
                return Err(format!("invalid identifier '{}'", bad));
            }
            Ok(PolicyValue::List(items))
        }
        ValueKind::BackupTypeList => {
            let items = string_list(value)?;
            for item in &items {
                BackupType::from_str(item).map_err(|_| format!("unknown backup type '{}'", item))?;
            }
            Ok(PolicyValue::List(items))
        }
    }
}

/// Sequence of strings, duplicates removed, first occurrence wins
fn string_list(value: &Value) -> std::result::Result<Vec<String>, String> {
    let Value::Sequence(seq) = value else {
        return Err(format!("expected a list, found {}", describe(value)));
    };
    let mut seen = BTreeSet::new();
    let mut items = Vec::new();
    for item in seq {
        let Some(s) = item.as_str() else {
            return Err(format!("expected a list of strings, found {}", describe(item)));
        };
        if seen.insert(s.to_string()) {
            items.push(s.to_string());
        }
    }
    Ok(items)
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "nothing".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("string '{}'", s),
        Value::Sequence(_) => "a list".to_string(),
        Value::Mapping(_) => "a mapping".to_string(),
        Value::Tagged(_) => "a tagged value".to_string(),
    }
}

// ============================================================================
// Store
// ============================================================================

/// Merged, validated, read-only policy model
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    document: PolicyDocument,
}

impl PolicyStore {
    /// Load and merge the retention-policy and backup-strategy documents
    pub fn load(retention: &Path, strategy: &Path) -> Result<Self> {
        let documents = vec![
            (retention.display().to_string(), PolicyDocument::from_file(retention)?),
            (strategy.display().to_string(), PolicyDocument::from_file(strategy)?),
        ];
        Self::from_documents(documents)
    }

    /// Merge already-parsed documents, in order
    pub fn from_documents(documents: Vec<(String, PolicyDocument)>) -> Result<Self> {
        let mut merged = PolicyDocument::default();
        for (origin, document) in documents {
            merge_scope(&mut merged.global, document.global, "global", &origin)?;
            for (name, attrs) in document.environments {
                let label = format!("environments.{}", name);
                let target = merged.environments.entry(name).or_default();
                merge_scope(target, attrs, &label, &origin)?;
            }
            for (name, attrs) in document.services {
                let label = format!("services.{}", name);
                let target = merged.services.entry(name).or_default();
                merge_scope(target, attrs, &label, &origin)?;
            }
        }
        Ok(Self { document: merged })
    }

    /// Parse and merge YAML sources given as `(origin, text)` pairs
    pub fn from_yaml(sources: &[(&str, &str)]) -> Result<Self> {
        let documents = sources
            .iter()
            .map(|(origin, text)| Ok((origin.to_string(), PolicyDocument::parse(text, origin)?)))
            .collect::<Result<Vec<_>>>()?;
        Self::from_documents(documents)
    }

    pub fn global(&self) -> &Attributes {
        &self.document.global
    }

    pub fn environment(&self, name: &str) -> Option<&Attributes> {
        self.document.environments.get(name)
    }

    pub fn service(&self, name: &str) -> Option<&Attributes> {
        self.document.services.get(name)
    }

    pub fn environment_names(&self) -> impl Iterator<Item = &str> {
        self.document.environments.keys().map(String::as_str)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.document.services.keys().map(String::as_str)
    }

    /// Every channel id mentioned by any scope
    pub fn referenced_channels(&self) -> BTreeSet<String> {
        let scopes = std::iter::once(&self.document.global)
            .chain(self.document.environments.values())
            .chain(self.document.services.values());
        scopes
            .filter_map(|attrs| attrs.get(&PolicyKey::NotificationsChannels))
            .filter_map(PolicyValue::as_list)
            .flatten()
            .cloned()
            .collect()
    }
}

fn merge_scope(target: &mut Attributes, incoming: Attributes, label: &str, origin: &str) -> Result<()> {
    for (key, value) in incoming {
        match target.get(&key) {
            Some(existing) if *existing != value => {
                return Err(EngineError::config(format!(
                    "{}: {}.{} = {} conflicts with an earlier document ({})",
                    origin, label, key, value, existing
                )));
            }
            Some(_) => {}
            None => {
                target.insert(key, value);
            }
        }
    }
    Ok(())
}
