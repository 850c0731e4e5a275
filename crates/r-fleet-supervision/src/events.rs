//! ---
//! fleet_section: "07-resilience-fault-tolerance"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Process state-change notifications."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use strum::{Display, EnumString};

/// Prefix of every process state event name.
pub const PROCESS_STATE_PREFIX: &str = "PROCESS_STATE_";

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Stopped on request.
    Stopped,
    /// Being started.
    Starting,
    /// Running.
    Running,
    /// Exited too quickly; the supervisor is retrying.
    Backoff,
    /// Being stopped.
    Stopping,
    /// Exited on its own.
    Exited,
    /// The supervisor gave up restarting it.
    Fatal,
    /// State the supervisor could not determine.
    Unknown,
}

impl ProcessState {
    /// State named by a `PROCESS_STATE_*` event name.
    pub fn from_event_name(event_name: &str) -> Option<Self> {
        event_name
            .strip_prefix(PROCESS_STATE_PREFIX)
            .and_then(|state| state.parse().ok())
    }

    /// The process is gone and will not come back without a new start.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Stopped | Self::Exited | Self::Fatal)
    }
}

/// Process state change as republished by the event bridge.
///
/// Numeric fields are accepted both as JSON numbers and as the strings
/// supervisord writes in its event bodies.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStateEvent {
    /// `PROCESS_STATE_*` event name.
    pub eventname: String,
    /// Supervised program name.
    pub processname: String,
    /// Program group name.
    #[serde(default)]
    pub groupname: String,
    /// State before the change.
    #[serde(default)]
    pub from_state: String,
    /// Process id, when the process had one.
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Whether an exit was expected (`EXITED` only).
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u8>,
}

impl ProcessStateEvent {
    /// New state carried by the event.
    pub fn state(&self) -> Option<ProcessState> {
        ProcessState::from_event_name(&self.eventname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn states_come_from_event_names() {
        assert_eq!(
            ProcessState::from_event_name("PROCESS_STATE_FATAL"),
            Some(ProcessState::Fatal)
        );
        assert_eq!(ProcessState::from_event_name("TICK_5"), None);
        assert!(ProcessState::Exited.is_final());
        assert!(!ProcessState::Backoff.is_final());
    }

    #[test]
    fn string_numbers_are_accepted() {
        let event: ProcessStateEvent = serde_json::from_value(json!({
            "eventname": "PROCESS_STATE_EXITED",
            "processname": "jobs_sample1",
            "groupname": "jobs_sample1",
            "from_state": "RUNNING",
            "pid": "2766",
            "expected": "0"
        }))
        .unwrap();
        assert_eq!(event.pid, Some(2766));
        assert_eq!(event.expected, Some(0));
        assert_eq!(event.state(), Some(ProcessState::Exited));
    }

    #[test]
    fn minimal_event_decodes() {
        let event: ProcessStateEvent = serde_json::from_value(json!({
            "eventname": "PROCESS_STATE_FATAL",
            "processname": "jobs_sample1",
            "pid": 12
        }))
        .unwrap();
        assert_eq!(event.pid, Some(12));
        assert!(event.expected.is_none());
        let encoded = serde_json::to_value(&event).unwrap();
        assert!(encoded.get("expected").is_none());
    }
}
