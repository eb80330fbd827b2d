// Blocking work run off the control loop via spawn_blocking
//
// Workers never touch supervisor state. Each one produces exactly one
// WorkerEvent that the control loop applies.

use crate::backends::process::{ProcessEntry, SpawnedChild};
use crate::config::SupervisorTimings;
use crate::drift::DriftMatch;
use crate::error::SupervisorError;
use crate::launch::LaunchSpec;
use crate::monitor::ProcessMonitor;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Who asked for a start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOrigin {
    User,
    AutoRestart,
}

#[derive(Debug)]
pub enum StartOutcome {
    /// The target showed up in the process table
    Confirmed { pid: u32, child: SpawnedChild },
    Failed { reason: String },
    /// A stop arrived while waiting; the child (if spawned) still needs terminating
    Abandoned { child: Option<SpawnedChild> },
}

/// Messages from workers and timers back to the control loop
#[derive(Debug)]
pub enum WorkerEvent {
    StartFinished {
        id: String,
        origin: StartOrigin,
        outcome: StartOutcome,
    },
    StopFinished(Result<(), SupervisorError>),
    /// Liveness result; `epoch` identifies the poll so stale answers can be dropped
    Polled {
        epoch: u64,
        found: Option<ProcessEntry>,
    },
    Detected(Option<DriftMatch>),
    RestartDue { id: String },
}

/// Sleep in small steps so an abandon request is noticed promptly
fn sleep_unless(abandon: &AtomicBool, duration: Duration, step: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if abandon.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(step.min(deadline - now));
    }
}

/// Terminate the named companion apps and launch them again from their executables
///
/// Apps that hold connections open (Discord and the like) only pick up a new
/// strategy after a reconnect. Failures are logged and never block the start.
pub fn restart_companions(monitor: &ProcessMonitor, apps: &[String], grace: Duration) {
    for app in apps.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
        let executables: BTreeSet<PathBuf> = monitor
            .find_all(app)
            .into_iter()
            .filter_map(|entry| entry.exe)
            .collect();
        if executables.is_empty() {
            log::debug!("Companion app {} is not running", app);
            continue;
        }

        log::info!("Restarting companion app {}", app);
        if let Err(e) = monitor.terminate_all(app, grace) {
            log::warn!("Could not close {}: {}", app, e);
        }

        for exe in executables {
            let spec = LaunchSpec {
                working_dir: exe.parent().map(PathBuf::from).unwrap_or_default(),
                executable_path: exe,
                argv: Vec::new(),
            };
            match monitor.table().spawn(&spec) {
                Ok(child) => {
                    log::debug!("Relaunched {:?} as pid {}", spec.executable_path, child.pid())
                }
                Err(e) => log::warn!("Failed to relaunch {:?}: {:#}", spec.executable_path, e),
            }
        }
    }
}

/// Spawn the target and wait for a new instance of it to appear
///
/// Instances that were already running before the spawn never confirm the
/// start; only a pid absent from the pre-spawn snapshot counts.
pub fn run_start(
    monitor: &ProcessMonitor,
    spec: &LaunchSpec,
    companions: &[String],
    timings: &SupervisorTimings,
    abandon: &AtomicBool,
) -> StartOutcome {
    let step = timings.confirmation_poll;

    if !sleep_unless(abandon, timings.pre_spawn_settle, step) {
        return StartOutcome::Abandoned { child: None };
    }

    restart_companions(monitor, companions, timings.termination_grace);
    if abandon.load(Ordering::SeqCst) {
        return StartOutcome::Abandoned { child: None };
    }

    let name = spec.executable_name().unwrap_or_default();
    let preexisting: HashSet<u32> = monitor.find_all(name).iter().map(|e| e.pid).collect();
    if !preexisting.is_empty() {
        log::warn!(
            "{} instance(s) of {} already running before spawn",
            preexisting.len(),
            name
        );
    }

    let mut child = match monitor.table().spawn(spec) {
        Ok(child) => child,
        Err(e) => {
            return StartOutcome::Failed {
                reason: format!("{:#}", e),
            };
        }
    };
    log::debug!("Spawned {} (pid {})", name, child.pid());

    let deadline = Instant::now() + timings.start_confirmation;

    loop {
        if abandon.load(Ordering::SeqCst) {
            return StartOutcome::Abandoned { child: Some(child) };
        }

        let fresh = monitor
            .find_all(name)
            .into_iter()
            .find(|entry| !preexisting.contains(&entry.pid));
        if let Some(entry) = fresh {
            return StartOutcome::Confirmed {
                pid: entry.pid,
                child,
            };
        }

        if let Some(status) = child.try_exited() {
            if !status.success() {
                return StartOutcome::Failed {
                    reason: format!("{} exited early ({})", name, status),
                };
            }
        }

        if Instant::now() >= deadline {
            child.kill();
            return StartOutcome::Failed {
                reason: format!(
                    "{} did not appear within {:.1}s",
                    name,
                    timings.start_confirmation.as_secs_f64()
                ),
            };
        }

        thread::sleep(step);
    }
}

/// Terminate every instance by name, then make sure our own child is gone
pub fn run_stop(
    monitor: &ProcessMonitor,
    executable_name: &str,
    grace: Duration,
    child: Option<SpawnedChild>,
) -> Result<(), SupervisorError> {
    let result = monitor.terminate_all(executable_name, grace);
    if let Some(mut child) = child {
        child.kill();
    }
    result
}
