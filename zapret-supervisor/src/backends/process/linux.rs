// Linux process table using procfs

use super::{ProcessEntry, ProcessTable, Termination, unix_signal};
use anyhow::Result;
use procfs::process::all_processes;

pub struct ProcfsProcessTable;

impl ProcfsProcessTable {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcfsProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcfsProcessTable {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        let mut entries = Vec::new();

        // Processes can vanish mid-scan; skip whatever we fail to read
        for process in all_processes()?.flatten() {
            let Ok(stat) = process.stat() else {
                continue;
            };
            if stat.state == 'Z' {
                continue;
            }
            let Ok(pid) = u32::try_from(process.pid()) else {
                continue;
            };

            entries.push(ProcessEntry {
                pid,
                name: stat.comm,
                argv: process.cmdline().unwrap_or_default(),
                exe: process.exe().ok(),
                cwd: process.cwd().ok(),
            });
        }

        Ok(entries)
    }

    fn signal(&self, pid: u32, termination: Termination) -> Result<()> {
        unix_signal(pid, termination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_self_with_argv() {
        let me = std::process::id();
        let entries = ProcfsProcessTable::new().list_processes().unwrap();
        let entry = entries.iter().find(|e| e.pid == me).unwrap();
        assert!(!entry.argv.is_empty());
        assert!(entry.exe.is_some());
    }

    #[test]
    fn test_signal_to_missing_pid_is_ok() {
        // pid_max never reaches this value
        assert!(
            ProcfsProcessTable::new()
                .signal(i32::MAX as u32, Termination::Graceful)
                .is_ok()
        );
    }
}
