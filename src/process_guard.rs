//! Lifecycle of runtime child processes and run cancellation.
//!
//! Every administrative command goes through the container runtime CLI,
//! which this process spawns. Those children must not outlive a cancelled
//! or crashed run: an orphaned `docker exec pg_dump` keeps streaming into a
//! partial file nobody will ever commit.
//!
//! # Design
//! - Children run in their own process group with a parent-death signal
//! - Live child PIDs are tracked in a global registry
//! - The first SIGINT/SIGTERM/SIGHUP marks the run cancelled and terminates
//!   the tracked groups (SIGTERM, then SIGKILL after a grace period); the
//!   engine then finishes bookkeeping and exits with 130
//! - A second signal exits immediately

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

static PROCESS_CANCEL: OnceLock<CancelFlag> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL
pub const TERMINATION_GRACE: Duration = Duration::from_secs(3);

/// Shared cancellation state of a run.
///
/// The signal handlers set the process-wide flag returned by
/// [`CancelFlag::global`]; components poll it between and during commands.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A fresh, independent flag
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag wired to SIGINT/SIGTERM/SIGHUP
    pub fn global() -> Self {
        PROCESS_CANCEL.get_or_init(CancelFlag::new).clone()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Set the flag, returning whether it was already set
    fn cancel_again(&self) -> bool {
        self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Registry tracking runtime child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::trace!(pid, "registered child process");
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        tracing::trace!(pid, "unregistered child process");
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate every tracked process group and forget them
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.pids.is_empty() {
            return;
        }
        tracing::info!(count = self.pids.len(), "terminating runtime child processes");
        let pids: Vec<u32> = self.pids.drain().collect();
        for pid in pids {
            terminate_group(pid, grace_period);
        }
    }
}

/// SIGTERM a process group, escalate to SIGKILL once `grace_period` passes.
///
/// The caller still owns the `Child` handle and must reap it.
pub fn terminate_group(pgid: u32, grace_period: Duration) {
    if let Err(e) = send_signal_to_group(pgid, Signal::SIGTERM) {
        tracing::debug!(pgid, error = %e, "group SIGTERM failed, signalling leader");
        let _ = send_signal(pgid, Signal::SIGTERM);
    }

    let start = Instant::now();
    while start.elapsed() < grace_period {
        if !is_process_alive(pgid) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    if is_process_alive(pgid) {
        tracing::warn!(pgid, "process group ignored SIGTERM, sending SIGKILL");
        if send_signal_to_group(pgid, Signal::SIGKILL).is_err() {
            let _ = send_signal(pgid, Signal::SIGKILL);
        }
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Alive means present and neither zombie nor dead
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // The comm field may contain spaces; the state follows its closing paren
        if let Some(state) = stat.rsplit_once(')').and_then(|(_, rest)| rest.split_whitespace().next()) {
            return !matches!(state, "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates all tracked children on drop
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(TERMINATION_GRACE);
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handling. Call once at program start.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    let cancel = CancelFlag::global();

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if cancel.cancel_again() {
                tracing::warn!(signal = sig, "second signal received, exiting immediately");
                if let Ok(mut registry) = ChildRegistry::global().lock() {
                    registry.terminate_all(Duration::ZERO);
                }
                std::process::exit(128 + sig);
            }

            tracing::warn!(signal = sig, "cancellation requested, stopping runtime commands");
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(TERMINATION_GRACE);
            }
        }
    });

    Ok(())
}

/// Extension trait for `std::process::Command` to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as the leader of a new process group that receives
    /// SIGTERM when this process dies.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn reap_within(child: &mut std::process::Child, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();
        registry.register(1234);
        registry.register(5678);
        assert_eq!(registry.count(), 2);
        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_group_kills_process_tree() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60 & wait"])
            .in_new_process_group()
            .spawn()
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        terminate_group(child.id(), Duration::from_millis(500));
        assert!(reap_within(&mut child, Duration::from_secs(2)));
    }

    #[test]
    fn test_sigterm_before_sigkill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap 'exit 0' TERM; while :; do sleep 1; done"])
            .in_new_process_group()
            .spawn()
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let mut registry = ChildRegistry::default();
        registry.register(child.id());
        registry.terminate_all(Duration::from_secs(2));

        assert!(reap_within(&mut child, Duration::from_secs(3)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_terminate_handles_already_dead_process() {
        let mut child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        let pid = child.id();
        let _ = child.wait();

        let mut registry = ChildRegistry::default();
        registry.register(pid);
        registry.terminate_all(Duration::from_millis(100));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_cancel_flags_are_independent() {
        let a = CancelFlag::new();
        let b = a.clone();
        let c = CancelFlag::new();
        assert!(!a.cancel_again());
        assert!(b.is_cancelled());
        assert!(!c.is_cancelled());
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
    }
}
