//! Typed arguments for the relational store tools (`pg_dump`, `psql`).
//!
//! # Field to Flag Mapping
//!
//! | Rust Field            | Flag / Env     | Notes                              |
//! |-----------------------|----------------|------------------------------------|
//! | `connection.user`     | `-U`           |                                    |
//! | `connection.database` | `-d`           |                                    |
//! | `connection.password` | `PGPASSWORD`   | env only, never argv               |
//! | `mode`                | `--schema-only` / `--data-only` | absent for full dumps |
//!
//! SQL text is assembled from identifiers that passed
//! [`is_sql_identifier`] at configuration load, plus integers.

use crate::command::AdminCommand;
use crate::types::BackupType;

/// `[A-Za-z_][A-Za-z0-9_]*`, optionally schema-qualified once
pub fn is_sql_identifier(name: &str) -> bool {
    fn part(s: &str) -> bool {
        let mut chars = s.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
    match name.split_once('.') {
        Some((schema, table)) => part(schema) && part(table),
        None => part(name),
    }
}

/// Connection parameters shared by both tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConnection {
    pub user: String,
    pub database: String,
    pub password: Option<String>,
}

impl PgConnection {
    fn args(&self) -> Vec<String> {
        vec![
            "-U".to_string(),
            self.user.clone(),
            "-d".to_string(),
            self.database.clone(),
        ]
    }

    fn env(&self) -> Vec<(String, String)> {
        self.password
            .iter()
            .map(|p| ("PGPASSWORD".to_string(), p.clone()))
            .collect()
    }
}

/// What `pg_dump` includes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    Full,
    SchemaOnly,
    DataOnly,
}

impl DumpMode {
    pub fn for_backup_type(backup_type: BackupType) -> Option<Self> {
        match backup_type {
            BackupType::Full => Some(Self::Full),
            BackupType::Schema => Some(Self::SchemaOnly),
            BackupType::Data => Some(Self::DataOnly),
            _ => None,
        }
    }

    fn flag(self) -> Option<&'static str> {
        match self {
            Self::Full => None,
            Self::SchemaOnly => Some("--schema-only"),
            Self::DataOnly => Some("--data-only"),
        }
    }
}

/// `pg_dump` writing a plain SQL script to stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgDumpArgs {
    pub connection: PgConnection,
    pub mode: DumpMode,
}

impl AdminCommand for PgDumpArgs {
    fn program(&self) -> &'static str {
        "pg_dump"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.connection.args();
        args.push("--no-owner".to_string());
        args.push("--no-privileges".to_string());
        if let Some(flag) = self.mode.flag() {
            args.push(flag.to_string());
        }
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.connection.env()
    }
}

/// Statements the cleanup procedure issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlStatement {
    /// Prints `t` or `f`
    TableExists { table: String },
    CountAll { table: String },
    /// Rows whose `column` is strictly older than `days` days
    CountExpired { table: String, column: String, days: u32 },
    /// Deletes expired rows, prints the number deleted
    DeleteExpired { table: String, column: String, days: u32 },
    VacuumAnalyze { table: String },
}

impl SqlStatement {
    pub fn render(&self) -> String {
        match self {
            Self::TableExists { table } => {
                format!("SELECT to_regclass('{}') IS NOT NULL", table)
            }
            Self::CountAll { table } => format!("SELECT count(*) FROM {}", table),
            Self::CountExpired { table, column, days } => format!(
                "SELECT count(*) FROM {} WHERE {} < now() - interval '1 day' * {}",
                table, column, days
            ),
            Self::DeleteExpired { table, column, days } => format!(
                "WITH deleted AS (DELETE FROM {} WHERE {} < now() - interval '1 day' * {} RETURNING 1) \
                 SELECT count(*) FROM deleted",
                table, column, days
            ),
            Self::VacuumAnalyze { table } => format!("VACUUM ANALYZE {}", table),
        }
    }
}

/// `psql` running one statement with unaligned, tuples-only output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsqlArgs {
    pub connection: PgConnection,
    pub statement: SqlStatement,
}

impl AdminCommand for PsqlArgs {
    fn program(&self) -> &'static str {
        "psql"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.connection.args();
        args.extend(
            ["-X", "-q", "-t", "-A", "-v", "ON_ERROR_STOP=1", "-c"]
                .into_iter()
                .map(String::from),
        );
        args.push(self.statement.render());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.connection.env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(password: Option<&str>) -> PgConnection {
        PgConnection {
            user: "app".to_string(),
            database: "appdb".to_string(),
            password: password.map(String::from),
        }
    }

    #[test]
    fn test_sql_identifier_validation() {
        assert!(is_sql_identifier("logs"));
        assert!(is_sql_identifier("_audit_2"));
        assert!(is_sql_identifier("public.sessions"));
        assert!(!is_sql_identifier(""));
        assert!(!is_sql_identifier("2fa"));
        assert!(!is_sql_identifier("logs; DROP TABLE users"));
        assert!(!is_sql_identifier("a.b.c"));
        assert!(!is_sql_identifier("logs'"));
    }

    #[test]
    fn test_pg_dump_modes() {
        let full = PgDumpArgs {
            connection: connection(None),
            mode: DumpMode::Full,
        };
        assert_eq!(
            full.to_cli_args(),
            vec!["-U", "app", "-d", "appdb", "--no-owner", "--no-privileges"]
        );

        let schema = PgDumpArgs {
            connection: connection(None),
            mode: DumpMode::for_backup_type(BackupType::Schema).unwrap(),
        };
        assert_eq!(schema.to_cli_args().last().unwrap(), "--schema-only");
        assert!(DumpMode::for_backup_type(BackupType::Snapshot).is_none());
    }

    #[test]
    fn test_password_travels_in_env() {
        let args = PgDumpArgs {
            connection: connection(Some("s3cret")),
            mode: DumpMode::DataOnly,
        };
        assert!(!args.to_cli_args().iter().any(|a| a.contains("s3cret")));
        assert!(!args.describe().contains("s3cret"));
        assert_eq!(
            args.get_env_vars(),
            vec![("PGPASSWORD".to_string(), "s3cret".to_string())]
        );
    }

    #[test]
    fn test_expiry_statements_use_strict_comparison() {
        let delete = SqlStatement::DeleteExpired {
            table: "sessions".to_string(),
            column: "created_at".to_string(),
            days: 7,
        };
        assert_eq!(
            delete.render(),
            "WITH deleted AS (DELETE FROM sessions WHERE created_at < now() - interval '1 day' * 7 RETURNING 1) \
             SELECT count(*) FROM deleted"
        );

        let psql = PsqlArgs {
            connection: connection(None),
            statement: SqlStatement::TableExists {
                table: "logs".to_string(),
            },
        };
        let args = psql.to_cli_args();
        assert_eq!(args[args.len() - 2], "-c");
        assert_eq!(args[args.len() - 1], "SELECT to_regclass('logs') IS NOT NULL");
    }
}
