// Supervisor state record and the notifications built from it

use crate::error::SupervisorError;
use chrono::{DateTime, Local};
use std::fmt;

/// Lifecycle of the supervised winws instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum State {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// A winws process is up that this supervisor did not start
    ExternallyRunning,
}

impl State {
    /// True when a winws process is believed to be alive
    pub fn is_active(self) -> bool {
        matches!(self, State::Running | State::ExternallyRunning)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::ExternallyRunning => "externally running",
        };
        f.write_str(name)
    }
}

/// Snapshot published on every transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    pub state: State,
    /// Strategy of the running instance, if known
    pub strategy_id: Option<String>,
    /// The running instance was spawned by this supervisor
    pub session_owned: bool,
    /// Set while a start is waiting for confirmation
    pub launch_timestamp: Option<DateTime<Local>>,
    /// Strategy of the most recent start attempt, kept after a failure
    pub attempted_strategy_id: Option<String>,
    /// Drift detector confidence when `strategy_id` was inferred
    pub match_confidence: Option<f64>,
}

impl Status {
    /// Forget everything about the instance that just went away
    pub(crate) fn clear_instance(&mut self) {
        self.strategy_id = None;
        self.session_owned = false;
        self.launch_timestamp = None;
        self.match_confidence = None;
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        match (&self.strategy_id, self.state) {
            (Some(id), _) if self.session_owned => write!(f, " ({})", id),
            (Some(id), _) => match self.match_confidence {
                Some(confidence) => write!(f, " (external, looks like {} at {:.0}%)", id, confidence * 100.0),
                None => write!(f, " (external, {})", id),
            },
            (None, State::ExternallyRunning) => write!(f, " (external, unknown strategy)"),
            (None, State::Starting) => match &self.attempted_strategy_id {
                Some(id) => write!(f, " ({})", id),
                None => Ok(()),
            },
            (None, _) => Ok(()),
        }
    }
}

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StatusChanged(Status),
    /// A start was refused before anything was spawned
    StartRejected { id: String, error: SupervisorError },
    /// Spawn failed or the process never showed up
    LaunchFailed { id: String, error: SupervisorError },
    /// Processes survived termination
    TerminationFailed(SupervisorError),
}
