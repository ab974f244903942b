//! Effective policy resolution.
//!
//! # Resolution Rules
//!
//! | Step | Scope                          | Applies when              |
//! |------|--------------------------------|---------------------------|
//! | 1    | `services.<service>`           | a service is given        |
//! | 2    | `environments.<environment>`   | always                    |
//! | 3    | `global`                       | always                    |
//! | 4    | built-in constant              | nothing above defines it  |
//!
//! Service overrides are environment-agnostic: once present they win in
//! every environment. Environment-scoped questions (schedule, notification
//! routing) are asked without a service and skip step 1.
//!
//! The resolver holds no state of its own, so identical calls against the
//! same store always return identical answers.

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use strum::IntoEnumIterator;

use super::{PolicyKey, PolicyStore, PolicyValue};
use crate::cron::CronExpression;
use crate::types::{BackupType, OperationKind, Scope};

/// A resolved value together with the scope that supplied it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub key: PolicyKey,
    pub value: PolicyValue,
    pub scope: Scope,
}

/// Read-only view over a [`PolicyStore`] that walks the override chain
#[derive(Debug, Clone, Copy)]
pub struct PolicyResolver<'a> {
    store: &'a PolicyStore,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(store: &'a PolicyStore) -> Self {
        Self { store }
    }

    /// Resolve one key. Never fails; a key no scope defines resolves to its
    /// built-in constant and logs a warning.
    pub fn resolve(&self, environment: &str, service: Option<&str>, key: PolicyKey) -> Resolved {
        let resolved = self.lookup(environment, service, key);
        if resolved.scope == Scope::BuiltIn {
            tracing::warn!(
                environment,
                service = service.unwrap_or("-"),
                key = %key,
                value = %resolved.value,
                "policy key unresolvable in any scope, using built-in default"
            );
        }
        resolved
    }

    /// Every key resolved for a target, without warnings (used by `status`)
    pub fn effective(&self, environment: &str, service: Option<&str>) -> Vec<Resolved> {
        PolicyKey::iter()
            .map(|key| self.lookup(environment, service, key))
            .collect()
    }

    fn lookup(&self, environment: &str, service: Option<&str>, key: PolicyKey) -> Resolved {
        let chain = [
            (Scope::Service, service.and_then(|s| self.store.service(s))),
            (Scope::Environment, self.store.environment(environment)),
            (Scope::Global, Some(self.store.global())),
        ];

        for (scope, attributes) in chain {
            if let Some(value) = attributes.and_then(|attrs| attrs.get(&key)) {
                return Resolved {
                    key,
                    value: value.clone(),
                    scope,
                };
            }
        }

        Resolved {
            key,
            value: key.builtin(),
            scope: Scope::BuiltIn,
        }
    }

    // ------------------------------------------------------------------
    // Typed accessors. Values were type-checked at load time, so the
    // fallbacks below only guard against a key/shape mismatch in code.
    // ------------------------------------------------------------------

    pub fn flag(&self, environment: &str, service: Option<&str>, key: PolicyKey) -> bool {
        let resolved = self.resolve(environment, service, key);
        resolved
            .value
            .as_bool()
            .or_else(|| key.builtin().as_bool())
            .unwrap_or(false)
    }

    pub fn retention_days(&self, environment: &str, service: &str) -> u32 {
        let value = self
            .resolve(environment, Some(service), PolicyKey::RetentionDays)
            .value
            .as_u64()
            .unwrap_or(30);
        u32::try_from(value).unwrap_or(u32::MAX)
    }

    pub fn timeout(&self, environment: &str, service: &str) -> Duration {
        let secs = self
            .resolve(environment, Some(service), PolicyKey::TimeoutSeconds)
            .value
            .as_u64()
            .unwrap_or(1800);
        Duration::from_secs(secs)
    }

    /// Backup types requested by policy; empty means "adapter default"
    pub fn backup_types(&self, environment: &str, service: &str) -> Vec<BackupType> {
        self.resolve(environment, Some(service), PolicyKey::BackupTypes)
            .value
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|t| BackupType::from_str(t).ok())
            .collect()
    }

    pub fn channels(&self, environment: &str) -> Vec<String> {
        self.resolve(environment, None, PolicyKey::NotificationsChannels)
            .value
            .as_list()
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    /// Schedule for an operation at environment scope
    pub fn schedule(&self, environment: &str, kind: OperationKind) -> CronExpression {
        let key = match kind {
            OperationKind::Backup => PolicyKey::Schedule,
            OperationKind::Cleanup => PolicyKey::CleanupSchedule,
        };
        let resolved = self.resolve(environment, None, key);
        resolved
            .value
            .as_text()
            .and_then(|text| CronExpression::parse(text).ok())
            .or_else(|| key.builtin().as_text().and_then(|t| CronExpression::parse(t).ok()))
            .unwrap_or_else(CronExpression::daily)
    }
}
