//! Property-based tests for stackkeeper
//!
//! These tests verify:
//! - Policy resolution precedence (service > environment > global > built-in)
//! - The strict retention boundary
//! - Artifact naming and identifier rules
//! - Schedule staggering

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use stackkeeper::artifact::{BackupArtifact, parse_file_name};
use stackkeeper::cron::CronExpression;
use stackkeeper::policy::{PolicyKey, PolicyResolver, PolicyStore, PolicyValue};
use stackkeeper::retention::is_expired;
use stackkeeper::types::{BackupType, Scope, Severity, is_valid_identifier};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

// =============================================================================
// Policy Resolution Property Tests
// =============================================================================

fn policy_yaml(global: Option<u32>, environment: Option<u32>, service: Option<u32>) -> String {
    let mut text = String::new();
    if let Some(days) = global {
        text.push_str(&format!("global:\n  retention_days: {}\n", days));
    }
    if let Some(days) = environment {
        text.push_str(&format!("environments:\n  production:\n    retention_days: {}\n", days));
    }
    if let Some(days) = service {
        text.push_str(&format!("services:\n  relational-store:\n    retention_days: {}\n", days));
    }
    if text.is_empty() {
        text.push_str("global: {}\n");
    }
    text
}

proptest! {
    /// The most specific scope that defines a key always wins
    #[test]
    fn resolution_prefers_most_specific_scope(
        global in proptest::option::of(0u32..400),
        environment in proptest::option::of(0u32..400),
        service in proptest::option::of(0u32..400),
    ) {
        let text = policy_yaml(global, environment, service);
        let store = PolicyStore::from_yaml(&[("retention.yaml", text.as_str())]).expect("valid policy");
        let resolver = PolicyResolver::new(&store);

        let resolved = resolver.resolve("production", Some("relational-store"), PolicyKey::RetentionDays);
        let (expected, scope) = match (service, environment, global) {
            (Some(days), _, _) => (u64::from(days), Scope::Service),
            (None, Some(days), _) => (u64::from(days), Scope::Environment),
            (None, None, Some(days)) => (u64::from(days), Scope::Global),
            (None, None, None) => (30, Scope::BuiltIn),
        };
        prop_assert_eq!(resolved.value, PolicyValue::Integer(expected));
        prop_assert_eq!(resolved.scope, scope);
    }

    /// Service overrides never leak into other services
    #[test]
    fn service_override_is_scoped_to_its_service(
        environment in 0u32..400,
        service in 0u32..400,
    ) {
        let text = policy_yaml(None, Some(environment), Some(service));
        let store = PolicyStore::from_yaml(&[("retention.yaml", text.as_str())]).expect("valid policy");
        let resolver = PolicyResolver::new(&store);

        prop_assert_eq!(resolver.retention_days("production", "cache-store"), environment);
        prop_assert_eq!(resolver.retention_days("production", "relational-store"), service);
    }
}

// =============================================================================
// Retention Boundary Property Tests
// =============================================================================

proptest! {
    /// An item is expired exactly when it is strictly older than the window
    #[test]
    fn expiry_is_strict(days in 0u32..3650, delta in -200_000i64..200_000) {
        let now = base_time();
        let created = now - Duration::days(i64::from(days)) - Duration::seconds(delta);
        prop_assert_eq!(is_expired(created, now, days), delta > 0);
    }

    /// A longer window never expires more items
    #[test]
    fn expiry_is_monotonic_in_window(age_secs in 0i64..400_000_000, days in 0u32..3650) {
        let now = base_time();
        let created = now - Duration::seconds(age_secs);
        if is_expired(created, now, days + 1) {
            prop_assert!(is_expired(created, now, days));
        }
    }
}

// =============================================================================
// Naming Property Tests
// =============================================================================

/// Strategy for generating valid service identifiers
fn identifier_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9-]{0,20}"
}

fn backup_type_strategy() -> impl Strategy<Value = BackupType> {
    prop_oneof![
        Just(BackupType::Full),
        Just(BackupType::Schema),
        Just(BackupType::Data),
        Just(BackupType::Snapshot),
        Just(BackupType::AppendLog),
        Just(BackupType::Collection),
        Just(BackupType::Config),
        Just(BackupType::Bucket),
        Just(BackupType::Artifacts),
    ]
}

proptest! {
    /// Generated identifiers are accepted
    #[test]
    fn identifiers_are_valid(name in identifier_strategy()) {
        prop_assert!(is_valid_identifier(&name));
    }

    /// Underscores and uppercase are always rejected
    #[test]
    fn identifiers_reject_separators(prefix in "[a-z]{1,5}", suffix in "[a-z]{0,5}", bad in "[_A-Z./ ]") {
        let name = format!("{}{}{}", prefix, bad, suffix);
        prop_assert!(!is_valid_identifier(&name));
    }

    /// The artifact file name carries service, type, time and compression
    #[test]
    fn artifact_name_identifies_artifact(
        service in identifier_strategy(),
        backup_type in backup_type_strategy(),
        offset in 0i64..100_000_000,
        compressed in any::<bool>(),
    ) {
        let created_at = base_time() + Duration::seconds(offset);
        let name = BackupArtifact::file_name(&service, backup_type, created_at, compressed);
        let parsed = parse_file_name(&name).expect("own names must parse");
        prop_assert_eq!(parsed.service, service);
        prop_assert_eq!(parsed.backup_type, backup_type);
        prop_assert_eq!(parsed.created_at, created_at);
        prop_assert_eq!(parsed.compressed, compressed);
    }

    /// Partial files are never mistaken for artifacts
    #[test]
    fn hidden_names_are_ignored(service in identifier_strategy(), backup_type in backup_type_strategy()) {
        let name = BackupArtifact::file_name(&service, backup_type, base_time(), false);
        let hidden = format!(".{}.partial", name);
        prop_assert!(parse_file_name(&hidden).is_none());
    }
}

// =============================================================================
// Schedule Property Tests
// =============================================================================

proptest! {
    /// Staggering moves a daily job later by exactly the offset, or refuses
    #[test]
    fn stagger_moves_later_by_offset(minute in 0u32..60, hour in 0u32..24, step in 1u32..12) {
        let expr = CronExpression::parse(&format!("{} {} * * *", minute, hour)).expect("valid cron");
        let offset = step * 5;
        let target = hour * 60 + minute + offset;
        match expr.stagger(offset) {
            Some(shifted) => {
                let expected = format!("{} {} * * *", target % 60, target / 60);
                prop_assert_eq!(shifted.as_str(), expected.as_str());
                prop_assert!(CronExpression::parse(shifted.as_str()).is_ok());
            }
            None => prop_assert!(target >= 24 * 60),
        }
    }

    /// Minute lists, ranges and steps are left alone
    #[test]
    fn stagger_refuses_non_fixed_minutes(step in 2u32..30, offset in 1u32..60) {
        let expr = CronExpression::parse(&format!("*/{} * * * *", step)).expect("valid cron");
        prop_assert!(expr.stagger(offset).is_none());
    }
}

// =============================================================================
// Severity Property Tests
// =============================================================================

proptest! {
    /// Severity depends only on whether anything failed or succeeded
    #[test]
    fn severity_from_counts(succeeded in 0usize..50, failed in 0usize..50) {
        let severity = Severity::from_counts(succeeded, failed);
        let expected = if failed == 0 {
            Severity::Info
        } else if succeeded == 0 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        prop_assert_eq!(severity, expected);
    }
}
