//! Container runtime invocation.
//!
//! This module is the only place that spawns processes on behalf of a
//! backend. Every administrative command goes through
//! [`ContainerRuntime::exec`] or [`ContainerRuntime::exec_to_file`], which:
//!
//! - isolate the runtime CLI in its own process group
//! - register the child PID for termination on exit
//! - enforce the caller's time budget
//! - stop the child as soon as the run is cancelled
//!
//! # Architecture Rule
//!
//! Adapters never build `Command`s themselves; they hand a typed
//! [`AdminCommand`] to the runtime they were given. Tests substitute an
//! in-process fake implementing the same trait.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::command::AdminCommand;
use crate::error::RuntimeError;
use crate::process_guard::{self, CancelFlag, ChildRegistry, CommandProcessGroup};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Budget for `inspect` probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// "Is container running" and "exec administrative command"
pub trait ContainerRuntime: Send + Sync {
    /// `Ok` when the container is running, `Unreachable` otherwise
    fn is_reachable(&self, container: &str) -> Result<(), RuntimeError>;

    /// Run a command inside the container and capture its output
    fn exec(
        &self,
        container: &str,
        command: &dyn AdminCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError>;

    /// Run a command inside the container, streaming stdout into `dest`.
    /// Returns the number of bytes written.
    fn exec_to_file(
        &self,
        container: &str,
        command: &dyn AdminCommand,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64, RuntimeError>;
}

/// Runtime driven through a Docker-compatible CLI (`docker`, `podman`)
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    program: String,
    cancel: CancelFlag,
}

impl DockerRuntime {
    pub fn new(program: impl Into<String>, cancel: CancelFlag) -> Self {
        Self {
            program: program.into(),
            cancel,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `exec [-e NAME].. <container> <program> <args>..`
    ///
    /// Environment values are set on the runtime CLI process and forwarded
    /// by name, so they never appear in argv.
    pub fn exec_args(&self, container: &str, command: &dyn AdminCommand) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        for (name, _) in command.get_env_vars() {
            args.push("-e".to_string());
            args.push(name);
        }
        args.push(container.to_string());
        args.push(command.program().to_string());
        args.extend(command.to_cli_args());
        args
    }

    fn exec_command(&self, container: &str, command: &dyn AdminCommand) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.exec_args(container, command));
        for (name, value) in command.get_env_vars() {
            cmd.env(name, value);
        }
        cmd
    }

    /// Spawn, supervise and reap one child.
    fn supervise(
        &self,
        mut cmd: Command,
        label: &str,
        stdout: Option<File>,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        if self.cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if timeout.is_zero() {
            return Err(RuntimeError::TimedOut {
                command: label.to_string(),
                after: timeout,
            });
        }

        cmd.stdin(Stdio::null()).stderr(Stdio::piped());
        match stdout {
            Some(file) => cmd.stdout(Stdio::from(file)),
            None => cmd.stdout(Stdio::piped()),
        };
        cmd.in_new_process_group();

        tracing::debug!(command = label, timeout_secs = timeout.as_secs(), "spawning runtime command");
        let mut child = cmd.spawn().map_err(|source| RuntimeError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let started = Instant::now();
        let outcome: Result<ExitStatus, RuntimeError> = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(e) => break Err(RuntimeError::Io(e)),
            }
            if self.cancel.is_cancelled() {
                process_guard::terminate_group(pid, process_guard::TERMINATION_GRACE);
                let _ = child.wait();
                break Err(RuntimeError::Cancelled);
            }
            if started.elapsed() >= timeout {
                tracing::warn!(command = label, "command exceeded its time budget, terminating");
                process_guard::terminate_group(pid, process_guard::TERMINATION_GRACE);
                let _ = child.wait();
                break Err(RuntimeError::TimedOut {
                    command: label.to_string(),
                    after: timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let stdout = collect(stdout_reader);
        let stderr = collect(stderr_reader);
        let status = outcome?;

        if !status.success() {
            if self.cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            return Err(RuntimeError::Failed {
                command: label.to_string(),
                code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

pub(crate) fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

pub(crate) fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .map(|handle| handle.join().unwrap_or_default())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

impl ContainerRuntime for DockerRuntime {
    fn is_reachable(&self, container: &str) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["inspect", "--format", "{{.State.Running}}", container]);
        let label = format!("{} inspect {}", self.program, container);

        match self.supervise(cmd, &label, None, PROBE_TIMEOUT) {
            Ok(output) if output.stdout.trim() == "true" => Ok(()),
            Ok(_) => Err(RuntimeError::Unreachable {
                container: container.to_string(),
                reason: "container is not running".to_string(),
            }),
            Err(RuntimeError::Failed { stderr, .. }) => Err(RuntimeError::Unreachable {
                container: container.to_string(),
                reason: stderr,
            }),
            Err(other) => Err(other),
        }
    }

    fn exec(
        &self,
        container: &str,
        command: &dyn AdminCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        let cmd = self.exec_command(container, command);
        self.supervise(cmd, &command.describe(), None, timeout)
    }

    fn exec_to_file(
        &self,
        container: &str,
        command: &dyn AdminCommand,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64, RuntimeError> {
        let file = File::create(dest)?;
        let cmd = self.exec_command(container, command);
        self.supervise(cmd, &command.describe(), Some(file), timeout)?;
        Ok(std::fs::metadata(dest)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::postgres::{DumpMode, PgConnection, PgDumpArgs};

    fn runtime() -> DockerRuntime {
        DockerRuntime::new("docker", CancelFlag::new())
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn test_exec_args_forward_env_by_name() {
        let dump = PgDumpArgs {
            connection: PgConnection {
                user: "postgres".to_string(),
                database: "app".to_string(),
                password: Some("hunter2".to_string()),
            },
            mode: DumpMode::Full,
        };
        let args = runtime().exec_args("stack-production-postgres", &dump);
        assert_eq!(
            args,
            vec![
                "exec", "-e", "PGPASSWORD", "stack-production-postgres", "pg_dump", "-U",
                "postgres", "-d", "app", "--no-owner", "--no-privileges",
            ]
        );
        assert!(!args.iter().any(|a| a.contains("hunter2")));
    }

    #[test]
    fn test_supervise_captures_output() {
        let out = runtime()
            .supervise(sh("echo hello; echo oops >&2"), "echo", None, Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[test]
    fn test_supervise_reports_exit_code() {
        let err = runtime()
            .supervise(sh("echo broken >&2; exit 3"), "false", None, Duration::from_secs(5))
            .unwrap_err();
        match err {
            RuntimeError::Failed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_supervise_enforces_timeout() {
        let started = Instant::now();
        let err = runtime()
            .supervise(sh("sleep 30"), "sleep", None, Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_supervise_streams_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let file = File::create(&dest).unwrap();
        runtime()
            .supervise(sh("printf abc"), "printf", Some(file), Duration::from_secs(5))
            .unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "abc");
    }

    #[test]
    fn test_cancelled_flag_stops_command() {
        let cancel = CancelFlag::new();
        let runtime = DockerRuntime::new("docker", cancel.clone());
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let err = runtime
            .supervise(sh("sleep 30"), "sleep", None, Duration::from_secs(20))
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, RuntimeError::Cancelled));

        let err = runtime
            .supervise(sh("true"), "true", None, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
    }

    #[test]
    fn test_missing_runtime_binary() {
        let runtime = DockerRuntime::new("/nonexistent/docker", CancelFlag::new());
        let err = runtime.is_reachable("anything").unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }
}
