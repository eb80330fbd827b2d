// zapret-supervisor: strategy catalog, launch plans and the winws process supervisor

pub mod backends;
pub mod catalog;
pub mod config;
pub mod drift;
pub mod error;
pub mod filters;
pub mod launch;
pub mod monitor;
pub mod plan;
pub mod ports;
pub mod rule;
pub mod script;
pub mod supervisor;

pub use error::SupervisorError;
pub use supervisor::{State, Status, Supervisor, SupervisorEvent, SupervisorHandle};
