// Error taxonomy surfaced by the supervisor to its callers

use crate::supervisor::State;
use thiserror::Error;

/// Errors the supervisor reports to the UI layer
///
/// Configuration problems are detected before anything is spawned. Launch
/// failures leave the supervisor in `Stopped`. Termination errors only show
/// up when a forced kill also failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SupervisorError {
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("invalid strategy configuration: {0}")]
    Config(String),

    #[error("failed to launch strategy '{id}': {reason}")]
    Launch { id: String, reason: String },

    #[error("{survivors} {name} process(es) survived a forced kill")]
    Termination { name: String, survivors: usize },

    #[error("a {0} operation is already in flight")]
    Busy(&'static str),

    #[error("cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: State },

    #[error("supervisor control loop has shut down")]
    Closed,
}

impl SupervisorError {
    /// True for errors raised before a start was dispatched
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            SupervisorError::UnknownStrategy(_) | SupervisorError::Config(_)
        )
    }
}
