use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{CONFIG_ENV, DEFAULT_CONFIG_PATH};
use crate::types::BackupType;

/// stackkeeper - policy-driven backup and retention for a container stack
#[derive(Parser, Debug)]
#[command(name = "stackkeeper")]
#[command(about = "Policy-driven backup and retention engine for a containerized service stack")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file
    #[arg(long, global = true, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Back up every service of an environment
    Backup {
        environment: String,
    },
    /// Back up one service, optionally one backup type
    BackupService {
        service: String,
        environment: String,
        /// e.g. full, schema, data, snapshot, append-log, collection, config, bucket, artifacts
        backup_type: Option<BackupType>,
    },
    /// Age-based cleanup of every service of an environment
    Cleanup {
        environment: String,
    },
    /// Age-based cleanup of one service
    CleanupService {
        service: String,
        environment: String,
    },
    /// Dry-run cleanup and schedule preview; changes nothing
    Test {
        environment: String,
    },
    /// Resolved policy, latest artifacts and recent runs
    Status {
        environment: Option<String>,
    },
    /// List backup artifacts of an environment
    List {
        environment: String,
    },
    /// Show installed schedule entries
    Schedule,
    /// Install or update the schedule entries of an environment
    ScheduleInstall {
        environment: String,
    },
    /// Remove the schedule entries of one environment, or all of them
    ScheduleRemove {
        environment: Option<String>,
    },
    /// Load and cross-check configuration and policies
    Validate,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
