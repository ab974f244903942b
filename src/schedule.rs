//! Periodic scheduler entries.
//!
//! Policy `schedule` / `cleanup_schedule` values become lines in the user's
//! crontab, each tagged with an ownership marker:
//!
//! ```text
//! 0 2 * * * /usr/local/bin/stackkeeper --config /etc/stackkeeper.yaml backup production # stackkeeper:production:backup
//! ```
//!
//! # Design
//!
//! - **Owned lines only**: lines without a marker are preserved byte for
//!   byte and never counted.
//! - **Idempotent install**: an identical entry is left alone; a changed
//!   expression replaces the environment's line in place.
//! - **Staggering**: when another environment already fires the same
//!   operation at the same time, the minute is shifted in 5-minute steps.
//! - **Backend trait**: [`SchedulerBackend`] reads and writes the whole
//!   table; [`MemoryScheduler`] stands in for `crontab` in tests.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Mutex;

use crate::cron::CronExpression;
use crate::error::ScheduleError;
use crate::policy::PolicyKey;
use crate::policy::resolver::PolicyResolver;
use crate::process_guard::CommandProcessGroup;
use crate::types::{OperationKind, is_valid_identifier};

/// Start of the ownership marker
pub const MARKER: &str = "# stackkeeper:";

/// Minute shift per colliding environment
const STAGGER_STEP: u32 = 5;

/// One owned line of the scheduler table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub environment: String,
    pub kind: OperationKind,
    pub expression: CronExpression,
    pub command: String,
}

impl ScheduleEntry {
    pub fn marker(&self) -> String {
        format!("{}{}:{}", MARKER, self.environment, self.kind)
    }

    pub fn render(&self) -> String {
        format!("{} {} {}", self.expression, self.command, self.marker())
    }

    /// Parse an owned line; `None` for anything else
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.starts_with('#') {
            return None;
        }
        let (body, owner) = line.rsplit_once(MARKER)?;
        let (environment, kind) = owner.trim().split_once(':')?;
        if !is_valid_identifier(environment) {
            return None;
        }
        let kind = OperationKind::from_str(kind).ok()?;

        let field_count = if body.trim_start().starts_with('@') { 1 } else { 5 };
        let (fields, command) = split_fields(body, field_count)?;
        let expression = CronExpression::parse(&fields).ok()?;
        let command = command.trim();
        if command.is_empty() {
            return None;
        }

        Some(Self {
            environment: environment.to_string(),
            kind,
            expression,
            command: command.to_string(),
        })
    }
}

/// Split off the first `count` whitespace-separated fields
fn split_fields(text: &str, count: usize) -> Option<(String, &str)> {
    let mut rest = text.trim_start();
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields.join(" "), rest))
}

/// Quote a word for the `/bin/sh` that runs crontab commands
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:+,@".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// `<program> --config <path>`, the start of every entry's command
pub fn command_prefix(program: &Path, config: &Path) -> String {
    format!(
        "{} --config {}",
        shell_quote(&program.to_string_lossy()),
        shell_quote(&config.to_string_lossy())
    )
}

// ============================================================================
// Scheduler backends
// ============================================================================

/// Whole-table access to a periodic scheduler
pub trait SchedulerBackend: Send + Sync {
    fn read_table(&self) -> Result<Vec<String>, ScheduleError>;

    fn write_table(&self, lines: &[String]) -> Result<(), ScheduleError>;
}

/// The invoking user's crontab
pub struct CrontabScheduler {
    program: String,
}

impl CrontabScheduler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for CrontabScheduler {
    fn default() -> Self {
        Self::new("crontab")
    }
}

impl SchedulerBackend for CrontabScheduler {
    fn read_table(&self) -> Result<Vec<String>, ScheduleError> {
        let output = Command::new(&self.program)
            .arg("-l")
            .stdin(Stdio::null())
            .in_new_process_group()
            .output()
            .map_err(|e| ScheduleError::Read(format!("cannot run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // An empty table is reported as an error by crontab
            if stderr.contains("no crontab") {
                return Ok(Vec::new());
            }
            return Err(ScheduleError::Read(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect())
    }

    fn write_table(&self, lines: &[String]) -> Result<(), ScheduleError> {
        let mut child = Command::new(&self.program)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|e| ScheduleError::Write(format!("cannot run {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut table = lines.join("\n");
            table.push('\n');
            stdin
                .write_all(table.as_bytes())
                .map_err(|e| ScheduleError::Write(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ScheduleError::Write(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ScheduleError::Write(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// In-process table
#[derive(Debug, Default)]
pub struct MemoryScheduler {
    lines: Mutex<Vec<String>>,
    writes: Mutex<usize>,
}

impl MemoryScheduler {
    pub fn with_lines(lines: &[&str]) -> Self {
        Self {
            lines: Mutex::new(lines.iter().map(|l| l.to_string()).collect()),
            writes: Mutex::new(0),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of table writes so far
    pub fn writes(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }
}

impl SchedulerBackend for MemoryScheduler {
    fn read_table(&self) -> Result<Vec<String>, ScheduleError> {
        self.lines
            .lock()
            .map(|l| l.clone())
            .map_err(|e| ScheduleError::Read(e.to_string()))
    }

    fn write_table(&self, lines: &[String]) -> Result<(), ScheduleError> {
        let mut table = self.lines.lock().map_err(|e| ScheduleError::Write(e.to_string()))?;
        *table = lines.to_vec();
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }
}

// ============================================================================
// Configurator
// ============================================================================

/// What `install` did with one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EntryChange {
    Added,
    Replaced,
    Unchanged,
}

pub struct SchedulerConfigurator<'a> {
    backend: &'a dyn SchedulerBackend,
    /// Program and global flags every entry starts with
    command_prefix: String,
}

impl<'a> SchedulerConfigurator<'a> {
    pub fn new(backend: &'a dyn SchedulerBackend, command_prefix: impl Into<String>) -> Self {
        Self {
            backend,
            command_prefix: command_prefix.into(),
        }
    }

    fn command(&self, environment: &str, kind: OperationKind) -> String {
        format!("{} {} {}", self.command_prefix, kind, environment)
    }

    /// Owned entries in table order
    pub fn list(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        Ok(self
            .backend
            .read_table()?
            .iter()
            .filter_map(|line| ScheduleEntry::parse_line(line))
            .collect())
    }

    /// Entries `install` would write for `environment`, staggered against
    /// the other environments already in the table.
    pub fn plan(&self, resolver: &PolicyResolver<'_>, environment: &str) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let installed = self.list()?;
        Ok(self.plan_against(resolver, environment, &installed))
    }

    fn plan_against(
        &self,
        resolver: &PolicyResolver<'_>,
        environment: &str,
        installed: &[ScheduleEntry],
    ) -> Vec<ScheduleEntry> {
        let mut kinds = vec![OperationKind::Backup];
        if resolver.flag(environment, None, PolicyKey::CleanupEnabled) {
            kinds.push(OperationKind::Cleanup);
        }

        kinds
            .into_iter()
            .map(|kind| {
                let requested = resolver.schedule(environment, kind);
                let taken: Vec<&CronExpression> = installed
                    .iter()
                    .filter(|e| e.kind == kind && e.environment != environment)
                    .map(|e| &e.expression)
                    .collect();
                ScheduleEntry {
                    environment: environment.to_string(),
                    kind,
                    expression: stagger_free(requested, &taken),
                    command: self.command(environment, kind),
                }
            })
            .collect()
    }

    /// Install or update the entries of `environment`.
    ///
    /// The table is only rewritten when something changed.
    pub fn install(
        &self,
        resolver: &PolicyResolver<'_>,
        environment: &str,
    ) -> Result<Vec<(ScheduleEntry, EntryChange)>, ScheduleError> {
        let table = self.backend.read_table()?;
        let installed: Vec<ScheduleEntry> = table.iter().filter_map(|l| ScheduleEntry::parse_line(l)).collect();
        let planned = self.plan_against(resolver, environment, &installed);

        let mut changes: Vec<Option<EntryChange>> = vec![None; planned.len()];
        let mut updated = Vec::with_capacity(table.len() + planned.len());

        for line in &table {
            let Some(existing) = ScheduleEntry::parse_line(line).filter(|e| e.environment == environment) else {
                updated.push(line.clone());
                continue;
            };
            match planned.iter().position(|p| p.kind == existing.kind) {
                Some(i) if changes[i].is_none() => {
                    let change = if existing == planned[i] {
                        updated.push(line.clone());
                        EntryChange::Unchanged
                    } else {
                        updated.push(planned[i].render());
                        EntryChange::Replaced
                    };
                    changes[i] = Some(change);
                }
                // Duplicate or no longer wanted (cleanup disabled)
                _ => tracing::info!(environment, kind = %existing.kind, "dropping stale schedule entry"),
            }
        }

        for (entry, change) in planned.iter().zip(changes.iter_mut()) {
            if change.is_none() {
                updated.push(entry.render());
                *change = Some(EntryChange::Added);
            }
        }

        if updated != table {
            self.backend.write_table(&updated)?;
        }

        let result: Vec<(ScheduleEntry, EntryChange)> = planned
            .into_iter()
            .zip(changes)
            .map(|(entry, change)| (entry, change.unwrap_or(EntryChange::Unchanged)))
            .collect();
        for (entry, change) in &result {
            tracing::info!(environment, kind = %entry.kind, expression = %entry.expression, %change, "schedule entry");
        }
        Ok(result)
    }

    /// Remove owned entries of one environment, or all of them
    pub fn remove(&self, environment: Option<&str>) -> Result<usize, ScheduleError> {
        let table = self.backend.read_table()?;
        let before = table.len();
        let kept: Vec<String> = table
            .into_iter()
            .filter(|line| match ScheduleEntry::parse_line(line) {
                Some(entry) => environment.is_some_and(|env| entry.environment != env),
                None => true,
            })
            .collect();

        let removed = before - kept.len();
        if removed > 0 {
            self.backend.write_table(&kept)?;
        }
        tracing::info!(environment = environment.unwrap_or("*"), removed, "schedule entries removed");
        Ok(removed)
    }
}

/// First of `requested`, `+5`, `+10`, ... minutes that no other environment uses
fn stagger_free(requested: CronExpression, taken: &[&CronExpression]) -> CronExpression {
    if !taken.contains(&&requested) {
        return requested;
    }
    let mut offset = STAGGER_STEP;
    while offset < 60 {
        match requested.stagger(offset) {
            Some(candidate) if !taken.contains(&&candidate) => return candidate,
            Some(_) => offset += STAGGER_STEP,
            None => break,
        }
    }
    tracing::warn!(expression = %requested, "cannot stagger schedule, sharing the slot");
    requested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyStore;

    const PREFIX: &str = "/usr/local/bin/stackkeeper --config /etc/stackkeeper/stackkeeper.yaml";

    fn policies() -> PolicyStore {
        PolicyStore::from_yaml(&[(
            "strategy.yaml",
            r#"
global:
  schedule: "0 2 * * *"
environments:
  staging:
    cleanup_enabled: false
  development:
    schedule: "30 4 * * *"
"#,
        )])
        .unwrap()
    }

    #[test]
    fn test_line_round_trip() {
        let line = format!("0 2 * * * {} backup production # stackkeeper:production:backup", PREFIX);
        let entry = ScheduleEntry::parse_line(&line).unwrap();
        assert_eq!(entry.environment, "production");
        assert_eq!(entry.kind, OperationKind::Backup);
        assert_eq!(entry.expression.as_str(), "0 2 * * *");
        assert_eq!(entry.render(), line);

        let at = ScheduleEntry::parse_line("@daily /bin/sk cleanup dev # stackkeeper:dev:cleanup").unwrap();
        assert_eq!(at.expression.as_str(), "@daily");
        assert_eq!(at.command, "/bin/sk cleanup dev");
    }

    #[test]
    fn test_command_prefix_quoting() {
        assert_eq!(
            command_prefix(Path::new("/usr/local/bin/stackkeeper"), Path::new("/etc/stackkeeper/stackkeeper.yaml")),
            "/usr/local/bin/stackkeeper --config /etc/stackkeeper/stackkeeper.yaml"
        );
        assert_eq!(shell_quote("/opt/my stack/config.yaml"), "'/opt/my stack/config.yaml'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_unowned_lines_are_ignored() {
        assert!(ScheduleEntry::parse_line("0 1 * * * /usr/bin/certbot renew").is_none());
        assert!(ScheduleEntry::parse_line("# 0 2 * * * x # stackkeeper:production:backup").is_none());
        assert!(ScheduleEntry::parse_line("0 2 * * * x # stackkeeper:Production:backup").is_none());
        assert!(ScheduleEntry::parse_line("0 2 * * * x # stackkeeper:production:restore").is_none());
    }

    #[test]
    fn test_install_is_idempotent() {
        let store = policies();
        let resolver = PolicyResolver::new(&store);
        let table = MemoryScheduler::with_lines(&["MAILTO=ops@example.com", "0 1 * * * /usr/bin/certbot renew"]);
        let configurator = SchedulerConfigurator::new(&table, PREFIX);

        let first = configurator.install(&resolver, "production").unwrap();
        assert!(first.iter().all(|(_, c)| *c == EntryChange::Added));
        assert_eq!(table.lines().len(), 4);
        assert_eq!(table.writes(), 1);

        let second = configurator.install(&resolver, "production").unwrap();
        assert!(second.iter().all(|(_, c)| *c == EntryChange::Unchanged));
        assert_eq!(table.lines().len(), 4);
        assert_eq!(table.writes(), 1);
        assert_eq!(table.lines()[0], "MAILTO=ops@example.com");
    }

    #[test]
    fn test_changed_expression_replaced_in_place() {
        let store = policies();
        let resolver = PolicyResolver::new(&store);
        let table = MemoryScheduler::with_lines(&[
            "15 2 * * * /old/path backup development # stackkeeper:development:backup",
            "0 1 * * * /usr/bin/certbot renew",
        ]);
        let configurator = SchedulerConfigurator::new(&table, PREFIX);

        let result = configurator.install(&resolver, "development").unwrap();
        assert_eq!(result[0].1, EntryChange::Replaced);
        assert_eq!(result[1].1, EntryChange::Added);
        let lines = table.lines();
        assert!(lines[0].starts_with("30 4 * * * "));
        assert_eq!(lines[1], "0 1 * * * /usr/bin/certbot renew");
    }

    #[test]
    fn test_identical_expressions_are_staggered() {
        let store = policies();
        let resolver = PolicyResolver::new(&store);
        let table = MemoryScheduler::default();
        let configurator = SchedulerConfigurator::new(&table, PREFIX);

        configurator.install(&resolver, "production").unwrap();
        let staging = configurator.install(&resolver, "staging").unwrap();

        // staging has cleanup disabled: backup entry only
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].0.expression.as_str(), "5 2 * * *");

        // Reinstalling either side keeps the assignment stable
        let again = configurator.install(&resolver, "staging").unwrap();
        assert_eq!(again[0].1, EntryChange::Unchanged);
        let production = configurator.install(&resolver, "production").unwrap();
        assert_eq!(production[0].0.expression.as_str(), "0 2 * * *");
        assert_eq!(production[0].1, EntryChange::Unchanged);
    }

    #[test]
    fn test_remove_counts_owned_entries_only() {
        let store = policies();
        let resolver = PolicyResolver::new(&store);
        let table = MemoryScheduler::with_lines(&["0 1 * * * /usr/bin/certbot renew"]);
        let configurator = SchedulerConfigurator::new(&table, PREFIX);
        configurator.install(&resolver, "production").unwrap();
        configurator.install(&resolver, "development").unwrap();

        assert_eq!(configurator.remove(Some("production")).unwrap(), 2);
        assert_eq!(configurator.remove(Some("production")).unwrap(), 0);
        assert_eq!(configurator.remove(None).unwrap(), 2);
        assert_eq!(table.lines(), vec!["0 1 * * * /usr/bin/certbot renew"]);
    }

    #[test]
    fn test_disabling_cleanup_drops_its_entry() {
        let table = MemoryScheduler::with_lines(&[
            "0 3 * * * /bin/sk cleanup staging # stackkeeper:staging:cleanup",
        ]);
        let store = policies();
        let resolver = PolicyResolver::new(&store);
        let configurator = SchedulerConfigurator::new(&table, "/bin/sk");

        configurator.install(&resolver, "staging").unwrap();
        let entries = configurator.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, OperationKind::Backup);
    }
}
