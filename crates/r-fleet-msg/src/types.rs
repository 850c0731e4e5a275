//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Inbound messages and protocol payloads."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use crate::Result;

/// A message delivered by the broker on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

impl InboundMessage {
    /// Create a message from a topic and payload.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Decode the payload as JSON into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Payload as a loosely typed JSON value; empty payloads decode to `{}`.
    pub fn value(&self) -> Result<Value> {
        if self.payload.is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        self.json()
    }
}

/// Connection state published by a transport binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected; the binding is retrying in the background.
    #[default]
    Disconnected,
    /// Connected; `session` increases with every successful (re)connect.
    Connected {
        /// Monotonic connect counter.
        session: u64,
    },
}

impl ConnectionState {
    /// Whether the binding currently holds a broker session.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Status of a job execution in the remote jobs protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting in the thing's queue.
    Queued,
    /// Handed to the device.
    InProgress,
    /// Completed successfully.
    Succeeded,
    /// Completed unsuccessfully.
    Failed,
    /// Cancelled remotely.
    Canceled,
    /// Exceeded its remote timeout.
    TimedOut,
    /// Refused by the device.
    Rejected,
    /// Removed remotely.
    Removed,
}

impl JobStatus {
    /// Terminal statuses never return to an active state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::InProgress)
    }
}

/// Entry in a pending executions snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionSummary {
    /// Job identifier.
    pub job_id: String,
    /// Execution version for optimistic concurrency.
    #[serde(default)]
    pub version_number: i64,
    /// Execution number of this job on this thing.
    #[serde(default)]
    pub execution_number: i64,
}

/// Response to a pending executions request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJobs {
    /// Executions already handed to the device.
    #[serde(default)]
    pub in_progress_jobs: Vec<JobExecutionSummary>,
    /// Executions waiting to be started.
    #[serde(default)]
    pub queued_jobs: Vec<JobExecutionSummary>,
}

/// A job execution with its document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    /// Job identifier.
    pub job_id: String,
    /// Current status.
    pub status: JobStatus,
    /// Execution version for optimistic concurrency.
    #[serde(default)]
    pub version_number: i64,
    /// Execution number of this job on this thing.
    #[serde(default)]
    pub execution_number: i64,
    /// Job document; carries the `program` to run.
    #[serde(default)]
    pub job_document: Value,
    /// Remaining protocol fields, preserved for the descriptor handed to the program.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobExecution {
    /// Program named in the job document.
    pub fn program(&self) -> Option<&str> {
        self.job_document.get("program").and_then(Value::as_str)
    }
}

/// Response carrying an optional execution (start-next, describe, notify-next).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEnvelope {
    /// The execution, absent when nothing is pending.
    #[serde(default)]
    pub execution: Option<JobExecution>,
}

/// Status update request for a job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdateRequest {
    /// New status.
    pub status: JobStatus,
    /// Version the update is conditional on.
    pub expected_version: i64,
    /// Execution the update targets.
    pub execution_number: i64,
    /// Optional free-form details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<Map<String, Value>>,
}

/// Error body of a `/rejected` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectedResponse {
    /// Error code; a string for jobs, a number for shadows.
    #[serde(default)]
    pub code: Value,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

impl RejectedResponse {
    /// Code rendered as text regardless of its JSON type.
    pub fn code_text(&self) -> String {
        match &self.code {
            Value::String(code) => code.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Desired/reported pair of a shadow document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowState {
    /// Declared state.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub desired: Map<String, Value>,
    /// Observed state.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub reported: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Full shadow document as returned by `get/accepted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowDocument {
    /// State section.
    #[serde(default)]
    pub state: ShadowState,
    /// Document version.
    #[serde(default)]
    pub version: Option<i64>,
}

/// Payload of `update/documents`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowDocuments {
    /// Document before the update.
    #[serde(default)]
    pub previous: Option<ShadowDocument>,
    /// Document after the update.
    #[serde(default)]
    pub current: ShadowDocument,
}
