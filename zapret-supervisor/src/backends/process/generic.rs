// sysinfo-backed process table for Windows and other non-Linux targets

use super::{ProcessEntry, ProcessTable, Termination};
use anyhow::{Result, anyhow};
use std::ffi::OsStr;
use std::sync::Mutex;
#[cfg(not(unix))]
use sysinfo::Pid;
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

pub struct SysinfoProcessTable {
    // Cached System instance, refreshed per call instead of rebuilt
    system: Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::new()
            .with_cmd(UpdateKind::Always)
            .with_exe(UpdateKind::Always)
            .with_cwd(UpdateKind::Always)
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        let mut sys = self
            .system
            .lock()
            .map_err(|_| anyhow!("process cache lock poisoned"))?;
        sys.refresh_processes_specifics(ProcessesToUpdate::All, Self::refresh_kind());

        let entries = sys
            .processes()
            .iter()
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                argv: process
                    .cmd()
                    .iter()
                    .map(|arg| OsStr::new(arg).to_string_lossy().into_owned())
                    .collect(),
                exe: process.exe().map(|p| p.to_path_buf()),
                cwd: process.cwd().map(|p| p.to_path_buf()),
            })
            .collect();

        Ok(entries)
    }

    fn signal(&self, pid: u32, termination: Termination) -> Result<()> {
        #[cfg(unix)]
        {
            super::unix_signal(pid, termination)
        }

        #[cfg(not(unix))]
        {
            let mut sys = self
                .system
                .lock()
                .map_err(|_| anyhow!("process cache lock poisoned"))?;
            let target = Pid::from_u32(pid);
            sys.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[target]),
                ProcessRefreshKind::new(),
            );

            let Some(process) = sys.process(target) else {
                return Ok(());
            };
            let delivered = match termination {
                // Windows has no SIGTERM; sysinfo reports that as None
                Termination::Graceful => process
                    .kill_with(sysinfo::Signal::Term)
                    .unwrap_or_else(|| process.kill()),
                Termination::Forced => process.kill(),
            };
            if delivered {
                Ok(())
            } else {
                Err(anyhow!("failed to terminate pid {}", pid))
            }
        }
    }
}
