// Process monitor: liveness checks and two-phase termination by executable name
//
// Stateless on purpose; the supervisor decides when to call in.

use crate::backends::process::{ProcessEntry, ProcessTable, Termination};
use crate::error::SupervisorError;
use crate::launch::{path_file_name, same_executable};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How often survivors are re-checked while waiting out the grace period
const TERMINATION_POLL: Duration = Duration::from_millis(50);

/// How long a forced kill gets to take effect before we give up
const FORCED_KILL_WAIT: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct ProcessMonitor {
    table: Arc<dyn ProcessTable>,
}

impl ProcessMonitor {
    pub fn new(table: Arc<dyn ProcessTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<dyn ProcessTable> {
        &self.table
    }

    /// Name or executable file name equals `executable_name`, ignoring case
    pub fn matches(entry: &ProcessEntry, executable_name: &str) -> bool {
        same_executable(&entry.name, executable_name)
            || entry
                .exe
                .as_deref()
                .is_some_and(|exe| same_executable(path_file_name(exe), executable_name))
    }

    /// Matching processes ordered by pid; a failed scan counts as none
    pub fn find_all(&self, executable_name: &str) -> Vec<ProcessEntry> {
        match self.table.list_processes() {
            Ok(entries) => {
                let mut found: Vec<ProcessEntry> = entries
                    .into_iter()
                    .filter(|e| Self::matches(e, executable_name))
                    .collect();
                found.sort_by_key(|e| e.pid);
                found
            }
            Err(e) => {
                log::warn!("Process scan via {} failed: {:#}", self.table.name(), e);
                Vec::new()
            }
        }
    }

    pub fn is_running(&self, executable_name: &str) -> bool {
        !self.find_all(executable_name).is_empty()
    }

    pub fn find_first(&self, executable_name: &str) -> Option<ProcessEntry> {
        self.find_all(executable_name).into_iter().next()
    }

    /// Terminate every matching process: graceful first, forced after `grace`
    ///
    /// Blocks the calling thread. Only fails when processes survive the
    /// forced kill as well.
    pub fn terminate_all(&self, executable_name: &str, grace: Duration) -> Result<(), SupervisorError> {
        let targets = self.find_all(executable_name);
        if targets.is_empty() {
            log::debug!("No {} process to terminate", executable_name);
            return Ok(());
        }

        log::info!(
            "Terminating {} {} process(es)",
            targets.len(),
            executable_name
        );
        for target in &targets {
            if let Err(e) = self.table.signal(target.pid, Termination::Graceful) {
                log::warn!("Graceful stop of pid {} failed: {:#}", target.pid, e);
            }
        }

        let survivors = self.wait_for_exit(executable_name, grace);
        if survivors.is_empty() {
            return Ok(());
        }

        log::warn!(
            "{} process(es) ignored the graceful stop, forcing",
            survivors.len()
        );
        for survivor in &survivors {
            if let Err(e) = self.table.signal(survivor.pid, Termination::Forced) {
                log::warn!("Forced kill of pid {} failed: {:#}", survivor.pid, e);
            }
        }

        let remaining = self.wait_for_exit(executable_name, FORCED_KILL_WAIT);
        if remaining.is_empty() {
            Ok(())
        } else {
            log::error!(
                "{} {} process(es) survived a forced kill",
                remaining.len(),
                executable_name
            );
            Err(SupervisorError::Termination {
                name: executable_name.to_string(),
                survivors: remaining.len(),
            })
        }
    }

    /// Poll until nothing matches or `timeout` passes; returns what is left
    fn wait_for_exit(&self, executable_name: &str, timeout: Duration) -> Vec<ProcessEntry> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = self.find_all(executable_name);
            let now = Instant::now();
            if left.is_empty() || now >= deadline {
                return left;
            }
            thread::sleep(TERMINATION_POLL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::process::fake::FakeProcessTable;

    fn setup() -> (Arc<FakeProcessTable>, ProcessMonitor) {
        let table = Arc::new(FakeProcessTable::new());
        let monitor = ProcessMonitor::new(table.clone());
        (table, monitor)
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let (table, monitor) = setup();
        table.add_process("WinWS.exe", &[]);
        table.add_process("explorer.exe", &[]);

        assert!(monitor.is_running("winws.exe"));
        assert_eq!(monitor.find_all("winws.exe").len(), 1);
        assert!(!monitor.is_running("zapret.exe"));
    }

    #[test]
    fn test_find_first_lowest_pid() {
        let (table, monitor) = setup();
        let first = table.add_process("winws.exe", &["--wf-tcp=80"]);
        table.add_process("winws.exe", &[]);

        let found = monitor.find_first("winws.exe").unwrap();
        assert_eq!(found.pid, first);
        assert_eq!(found.argv, vec!["--wf-tcp=80"]);
    }

    #[test]
    fn test_graceful_stop_suffices() {
        let (table, monitor) = setup();
        let pid = table.add_process("winws.exe", &[]);

        monitor
            .terminate_all("winws.exe", Duration::from_millis(100))
            .unwrap();
        assert_eq!(table.signals(), vec![(pid, Termination::Graceful)]);
        assert!(!monitor.is_running("winws.exe"));
    }

    #[test]
    fn test_escalates_to_forced_kill() {
        let (table, monitor) = setup();
        table.set_ignore_graceful(true);
        let pid = table.add_process("winws.exe", &[]);

        monitor
            .terminate_all("winws.exe", Duration::from_millis(100))
            .unwrap();
        assert_eq!(
            table.signals(),
            vec![(pid, Termination::Graceful), (pid, Termination::Forced)]
        );
        assert_eq!(table.count_named("winws.exe"), 0);
    }

    #[test]
    fn test_unkillable_process_is_reported() {
        let (table, monitor) = setup();
        table.set_ignore_graceful(true);
        table.set_ignore_forced(true);
        table.add_process("winws.exe", &[]);
        table.add_process("winws.exe", &[]);

        let err = monitor
            .terminate_all("winws.exe", Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(
            err,
            SupervisorError::Termination {
                name: "winws.exe".to_string(),
                survivors: 2
            }
        );
    }

    #[test]
    fn test_nothing_to_terminate() {
        let (table, monitor) = setup();
        monitor
            .terminate_all("winws.exe", Duration::from_millis(50))
            .unwrap();
        assert!(table.signals().is_empty());
    }
}
