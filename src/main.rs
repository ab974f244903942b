//! stackkeeper - Main entry point
//!
//! Parses the command line, wires logging and signal handling, runs one
//! engine operation and maps its outcome to the exit code:
//!
//! | Code | Meaning                                                 |
//! |------|---------------------------------------------------------|
//! | 0    | every target succeeded                                  |
//! | 1    | one or more targets failed, or a pre-flight check did   |
//! | 2    | configuration invalid, unknown environment or service   |
//! | 130  | cancelled by signal                                     |

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;

use stackkeeper::cli::{Cli, Commands};
use stackkeeper::engine::Engine;
use stackkeeper::error::EngineError;
use stackkeeper::process_guard::{self, CancelFlag, ProcessGuard};
use stackkeeper::retention::CleanupReport;
use stackkeeper::sanity;
use stackkeeper::schedule::{CrontabScheduler, SchedulerConfigurator, command_prefix};
use stackkeeper::types::BackupType;

const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

const CRONTAB: &str = "crontab";

/// Initialize the logger: stderr, `RUST_LOG` overrides the default level
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Main application entry point
fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "stackkeeper starting");

    // Cancellation still works through the guard's Drop if this fails
    if let Err(e) = process_guard::init_signal_handlers() {
        tracing::warn!(error = %e, "failed to initialize signal handlers");
    }
    let _guard = ProcessGuard::new();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("✗ {:#}", e);
            let configuration = e
                .downcast_ref::<EngineError>()
                .is_some_and(EngineError::is_configuration);
            ExitCode::from(if configuration { EXIT_CONFIG } else { EXIT_FAILED })
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let cancel = CancelFlag::global();
    let engine = Engine::load(&cli.config, cancel.clone())
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let code = match &cli.command {
        Commands::Validate => {
            for line in engine.describe() {
                println!("{}", line);
            }
            println!("✓ configuration and policies are valid");
            ExitCode::SUCCESS
        }
        Commands::Backup { environment } => backup(&engine, environment, None, None)?,
        Commands::BackupService {
            service,
            environment,
            backup_type,
        } => backup(&engine, environment, Some(service), *backup_type)?,
        Commands::Cleanup { environment } => cleanup(&engine, environment, None)?,
        Commands::CleanupService { service, environment } => cleanup(&engine, environment, Some(service))?,
        Commands::Test { environment } => {
            engine.ensure_target(environment, None)?;
            preflight(&engine, &[engine.config().runtime.program.as_str(), CRONTAB])?;
            let crontab = CrontabScheduler::new(CRONTAB);
            let scheduler = SchedulerConfigurator::new(&crontab, entry_prefix(&cli.config)?);
            let test = engine.dry_test(environment, &scheduler)?;
            print_cleanup(&test.cleanup);
            println!("schedule entries that would be installed:");
            for entry in &test.schedule {
                println!("  {}", entry.render());
            }
            exit_code(test.cleanup.cancelled, test.cleanup.failed())
        }
        Commands::Status { environment } => {
            for status in engine.status(environment.as_deref())? {
                for line in status.render_lines() {
                    println!("{}", line);
                }
            }
            ExitCode::SUCCESS
        }
        Commands::List { environment } => {
            let artifacts = engine.list(environment)?;
            if artifacts.is_empty() {
                println!("no artifacts for {}", environment);
            }
            for artifact in artifacts {
                println!(
                    "{:<20} {:<11} {} {:>12} {}",
                    artifact.service,
                    artifact.backup_type.to_string(),
                    artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
                    artifact.size_bytes,
                    artifact.path.display()
                );
            }
            ExitCode::SUCCESS
        }
        Commands::Schedule => {
            let crontab = CrontabScheduler::new(CRONTAB);
            let scheduler = SchedulerConfigurator::new(&crontab, entry_prefix(&cli.config)?);
            let entries = engine.schedule_list(&scheduler)?;
            if entries.is_empty() {
                println!("no stackkeeper schedule entries installed");
            }
            for entry in entries {
                println!("{:<12} {:<8} {}", entry.environment, entry.kind.to_string(), entry.expression);
            }
            ExitCode::SUCCESS
        }
        Commands::ScheduleInstall { environment } => {
            engine.ensure_target(environment, None)?;
            preflight(&engine, &[CRONTAB])?;
            let crontab = CrontabScheduler::new(CRONTAB);
            let scheduler = SchedulerConfigurator::new(&crontab, entry_prefix(&cli.config)?);
            for (entry, change) in engine.schedule_install(&scheduler, environment)? {
                println!("{:<10} {}", change.to_string(), entry.render());
            }
            ExitCode::SUCCESS
        }
        Commands::ScheduleRemove { environment } => {
            preflight(&engine, &[CRONTAB])?;
            let crontab = CrontabScheduler::new(CRONTAB);
            let scheduler = SchedulerConfigurator::new(&crontab, entry_prefix(&cli.config)?);
            let removed = engine.schedule_remove(&scheduler, environment.as_deref())?;
            println!("removed {} schedule entr{}", removed, if removed == 1 { "y" } else { "ies" });
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

fn backup(
    engine: &Engine,
    environment: &str,
    service: Option<&str>,
    backup_type: Option<BackupType>,
) -> anyhow::Result<ExitCode> {
    engine.ensure_target(environment, service)?;
    preflight(engine, &[engine.config().runtime.program.as_str()])?;
    let completed = engine.backup(environment, service, backup_type)?;
    for line in completed.report.render_lines() {
        println!("{}", line);
    }
    Ok(exit_code(completed.report.cancelled, completed.report.failed()))
}

fn cleanup(engine: &Engine, environment: &str, service: Option<&str>) -> anyhow::Result<ExitCode> {
    engine.ensure_target(environment, service)?;
    preflight(engine, &[engine.config().runtime.program.as_str()])?;
    let completed = engine.cleanup(environment, service)?;
    print_cleanup(&completed.report);
    Ok(exit_code(completed.report.cancelled, completed.report.failed()))
}

fn print_cleanup(report: &CleanupReport) {
    for line in report.render_lines() {
        println!("{}", line);
    }
}

fn exit_code(cancelled: bool, failed: usize) -> ExitCode {
    if cancelled {
        ExitCode::from(EXIT_CANCELLED)
    } else if failed > 0 {
        ExitCode::from(EXIT_FAILED)
    } else {
        ExitCode::SUCCESS
    }
}

/// Required binaries on PATH and a writable backup root
fn preflight(engine: &Engine, binaries: &[&str]) -> anyhow::Result<()> {
    let result = sanity::verify_environment(binaries, Some(&engine.config().backup_root));
    if !result.is_ok() {
        bail!("pre-flight check failed:\n  {}", result.problems().join("\n  "));
    }
    tracing::debug!("pre-flight checks passed");
    Ok(())
}

/// Program and config path every schedule entry invokes
fn entry_prefix(config: &Path) -> anyhow::Result<String> {
    let program = std::env::current_exe().context("locating the stackkeeper executable")?;
    let config = config
        .canonicalize()
        .with_context(|| format!("resolving {}", config.display()))?;
    Ok(command_prefix(&program, &config))
}
