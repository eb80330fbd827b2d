// In-memory process table for tests

use super::{ProcessEntry, ProcessTable, SpawnedChild, Termination};
use crate::launch::LaunchSpec;
use anyhow::{Result, anyhow};
use std::path::PathBuf;
use std::sync::Mutex;

/// What happens when the fake is asked to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnBehavior {
    /// A matching process shows up immediately
    Appear,
    /// Spawn succeeds but the process never shows up
    Vanish,
    /// Spawn itself fails
    Fail(String),
}

#[derive(Debug)]
struct State {
    processes: Vec<ProcessEntry>,
    next_pid: u32,
    spawn_behavior: SpawnBehavior,
    ignore_graceful: bool,
    ignore_forced: bool,
    spawned: Vec<LaunchSpec>,
    signals: Vec<(u32, Termination)>,
}

#[derive(Debug)]
pub struct FakeProcessTable {
    state: Mutex<State>,
}

impl FakeProcessTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                processes: Vec::new(),
                next_pid: 1000,
                spawn_behavior: SpawnBehavior::Appear,
                ignore_graceful: false,
                ignore_forced: false,
                spawned: Vec::new(),
                signals: Vec::new(),
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Add a running process and return its pid
    pub fn add_process(&self, name: &str, argv: &[&str]) -> u32 {
        self.with_state(|s| {
            let pid = s.next_pid;
            s.next_pid += 1;
            s.processes.push(ProcessEntry {
                pid,
                name: name.to_string(),
                argv: argv.iter().map(|a| a.to_string()).collect(),
                exe: Some(PathBuf::from("/opt/zapret/bin").join(name)),
                cwd: Some(PathBuf::from("/opt/zapret/bin")),
            });
            pid
        })
    }

    /// Simulate every process with this name dying
    pub fn kill_all_named(&self, name: &str) {
        self.with_state(|s| s.processes.retain(|p| p.name != name));
    }

    pub fn set_spawn_behavior(&self, behavior: SpawnBehavior) {
        self.with_state(|s| s.spawn_behavior = behavior);
    }

    pub fn set_ignore_graceful(&self, ignore: bool) {
        self.with_state(|s| s.ignore_graceful = ignore);
    }

    pub fn set_ignore_forced(&self, ignore: bool) {
        self.with_state(|s| s.ignore_forced = ignore);
    }

    pub fn spawn_count(&self) -> usize {
        self.with_state(|s| s.spawned.len())
    }

    pub fn last_spawn(&self) -> Option<LaunchSpec> {
        self.with_state(|s| s.spawned.last().cloned())
    }

    pub fn signals(&self) -> Vec<(u32, Termination)> {
        self.with_state(|s| s.signals.clone())
    }

    pub fn count_named(&self, name: &str) -> usize {
        self.with_state(|s| s.processes.iter().filter(|p| p.name == name).count())
    }
}

impl ProcessTable for FakeProcessTable {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        Ok(self.with_state(|s| s.processes.clone()))
    }

    fn signal(&self, pid: u32, termination: Termination) -> Result<()> {
        self.with_state(|s| {
            s.signals.push((pid, termination));
            let ignored = match termination {
                Termination::Graceful => s.ignore_graceful,
                Termination::Forced => s.ignore_forced,
            };
            if !ignored {
                s.processes.retain(|p| p.pid != pid);
            }
        });
        Ok(())
    }

    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedChild> {
        let behavior = self.with_state(|s| {
            s.spawned.push(spec.clone());
            s.spawn_behavior.clone()
        });
        let name = spec.executable_name().unwrap_or("winws.exe").to_string();

        match behavior {
            SpawnBehavior::Appear => {
                let argv: Vec<&str> = spec.argv.iter().map(String::as_str).collect();
                Ok(SpawnedChild::detached(self.add_process(&name, &argv)))
            }
            SpawnBehavior::Vanish => Ok(SpawnedChild::detached(0)),
            SpawnBehavior::Fail(reason) => Err(anyhow!(reason)),
        }
    }
}
