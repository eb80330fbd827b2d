// Process table trait for platform-specific operations
//
// This module provides a platform-agnostic interface for enumerating,
// signalling and spawning OS processes. Linux reads procfs directly; other
// platforms go through sysinfo.

use crate::launch::LaunchSpec;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;

/// Snapshot of one OS process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub argv: Vec<String>,
    pub exe: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
}

/// How hard to ask a process to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM or the closest platform equivalent
    Graceful,
    /// SIGKILL / TerminateProcess
    Forced,
}

/// Platform-agnostic process access
pub trait ProcessTable: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// All live, non-zombie processes
    fn list_processes(&self) -> Result<Vec<ProcessEntry>>;

    /// Deliver a termination request; a pid that is already gone is not an error
    fn signal(&self, pid: u32, termination: Termination) -> Result<()>;

    /// Start the target process without waiting for it
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedChild> {
        spawn_command(spec)
    }
}

/// A process started by this supervisor
#[derive(Debug)]
pub struct SpawnedChild {
    pid: u32,
    child: Option<Child>,
}

impl SpawnedChild {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
        }
    }

    /// Handle without an OS child attached, for pids we cannot wait on
    pub fn detached(pid: u32) -> Self {
        Self { pid, child: None }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status if the process has already exited
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                log::debug!("Failed to poll child {}: {}", self.pid, e);
                None
            }
        }
    }

    /// Kill and reap the child, ignoring a child that already exited
    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill() {
                log::debug!("Kill of child {} failed: {}", self.pid, e);
            }
            let _ = child.wait();
        }
    }

    /// Collect the exit status so no zombie is left behind
    pub fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
    }
}

/// Spawn `spec` detached from our stdio
pub fn spawn_command(spec: &LaunchSpec) -> Result<SpawnedChild> {
    let mut command = Command::new(&spec.executable_path);
    command
        .args(&spec.argv)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {:?}", spec.executable_path))?;

    log::debug!("Spawned {:?} as pid {}", spec.executable_path, child.id());
    Ok(SpawnedChild::new(child))
}

/// Send SIGTERM / SIGKILL through nix
#[cfg(unix)]
pub(crate) fn unix_signal(pid: u32, termination: Termination) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let signal = match termination {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    let raw = i32::try_from(pid).context("pid out of range")?;

    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to send {} to pid {}", signal, pid)),
    }
}

// Platform-specific implementations
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::ProcfsProcessTable;

mod generic;
pub use generic::SysinfoProcessTable;

#[cfg(test)]
pub mod fake;

/// Factory function to create the platform's default ProcessTable
pub fn create_process_table() -> Arc<dyn ProcessTable> {
    create_process_table_with(None)
}

/// Factory function honoring a backend preference (`procfs` or `sysinfo`)
pub fn create_process_table_with(preference: Option<&str>) -> Arc<dyn ProcessTable> {
    let table: Arc<dyn ProcessTable> = match preference {
        Some("sysinfo") => Arc::new(SysinfoProcessTable::new()),
        Some(other) if other != default_backend() => {
            log::warn!(
                "Process backend '{}' is not available here, using {}",
                other,
                default_backend()
            );
            default_table()
        }
        _ => default_table(),
    };
    log::debug!("Using process backend: {}", table.name());
    table
}

fn default_backend() -> &'static str {
    if cfg!(target_os = "linux") {
        "procfs"
    } else {
        "sysinfo"
    }
}

fn default_table() -> Arc<dyn ProcessTable> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsProcessTable::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(SysinfoProcessTable::new())
    }
}
