//! ---
//! fleet_section: "07-resilience-fault-tolerance"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Supervision control plane and process lifecycle events."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Local process supervision as seen by the agent.
//!
//! The agent never spawns programs itself. It asks the supervisor to start,
//! stop or restart them ([`control`]) and learns about their lifecycle from
//! the supervisor's event feed ([`events`], [`listener`]).
#![warn(missing_docs)]

pub mod control;
pub mod events;
pub mod listener;

/// Result alias used throughout the supervision crate.
pub type Result<T> = std::result::Result<T, SupervisionError>;

/// Error type for the supervision control plane.
#[derive(Debug, thiserror::Error)]
pub enum SupervisionError {
    /// The control command failed or reported an error.
    #[error("{verb} {program} failed: {output}")]
    Command {
        /// Control verb (`start`, `stop`, `restart`, `pid`).
        verb: &'static str,
        /// Supervised program name.
        program: String,
        /// Captured output or failure reason.
        output: String,
    },
    /// The supervisor answered a pid query with something that is not a pid.
    #[error("unexpected pid output for {program}: {output:?}")]
    InvalidPid {
        /// Supervised program name.
        program: String,
        /// Raw output.
        output: String,
    },
    /// Malformed event-listener traffic.
    #[error("event protocol error: {0}")]
    Protocol(String),
    /// Wrapper for IO errors while talking to the supervisor.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub use control::{ControlAction, ControlCall, ProcessControl, RecordingControl, SupervisorCtl};
pub use events::{ProcessState, ProcessStateEvent};
pub use listener::{read_event, ListenerEvent, ListenerReply, Notification, READY};
