//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "MQTT binding, acknowledgement waiters and request correlation."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Messaging layer of the device agent.
//!
//! The broker connection is an asynchronous publish/subscribe pipe. This crate
//! turns it into something the reconcilers can reason about: acknowledgements
//! become futures ([`waiters`]), request/response exchanges become a single
//! awaited call keyed by a correlation token ([`correlator`]), and inbound
//! traffic is fanned out to every interested task ([`transport`]).
#![warn(missing_docs)]

use std::time::Duration;

pub mod correlator;
pub mod forward;
pub mod metrics;
pub mod qos;
pub mod rumqtt;
pub mod topics;
pub mod transport;
pub mod types;
pub mod waiters;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Failure modes of the messaging layer.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// No correlated response arrived within the call budget.
    #[error("no response for {topic} within {timeout:?} (token {token})")]
    RequestTimeout {
        /// Request topic.
        topic: String,
        /// Correlation token of the abandoned call.
        token: String,
        /// Budget that elapsed.
        timeout: Duration,
    },
    /// The remote side answered on the `/rejected` topic.
    #[error("request on {topic} rejected: {payload}")]
    Rejected {
        /// Topic the rejection arrived on.
        topic: String,
        /// Rejection body as sent by the remote side.
        payload: serde_json::Value,
    },
    /// Another call already waits on the same correlation token.
    #[error("correlation token {0} is already in flight")]
    DuplicateToken(String),
    /// Correlated payloads must be JSON objects so a token can be embedded.
    #[error("correlated payload must be a JSON object")]
    NotAnObject,
    /// The broker connection did not come up in time.
    #[error("broker connection not established within {0:?}")]
    ConnectTimeout(Duration),
    /// The broker did not acknowledge a subscribe/unsubscribe in time.
    #[error("broker did not acknowledge {operation} of {topic} within {timeout:?}")]
    AckTimeout {
        /// `subscribe` or `unsubscribe`.
        operation: &'static str,
        /// Topic filter concerned.
        topic: String,
        /// Budget that elapsed.
        timeout: Duration,
    },
    /// The broker refused a subscription.
    #[error("broker refused subscription to {0}")]
    SubscribeRefused(String),
    /// Client-side transport failure (request queue, connection loss).
    #[error("transport failure: {0}")]
    Transport(String),
    /// The transport was shut down while an operation was pending.
    #[error("transport closed")]
    Closed,
    /// Wrapper for IO errors encountered while loading transport material.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MessagingError {
    /// Whether the error is a timeout that the next heartbeat will retry.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            MessagingError::RequestTimeout { .. }
                | MessagingError::ConnectTimeout(_)
                | MessagingError::AckTimeout { .. }
        )
    }
}

pub use correlator::{CorrelatedResponse, Correlator, ResponseOutcome, CLIENT_TOKEN_FIELD};
pub use forward::{log_forwarder, LogForwardLayer, LogForwardQueue, LogRecord};
pub use metrics::MessagingMetrics;
pub use qos::DeliveryGuarantee;
pub use rumqtt::{RumqttSettings, RumqttTransport, TlsCredentials};
pub use transport::{
    AckMode, LoopbackTransport, MqttTransport, MqttTransportExt, PublishedMessage,
};
pub use types::{ConnectionState, InboundMessage};
pub use waiters::{connect_and_wait, subscribe_all, subscribe_and_wait, unsubscribe_and_wait};
