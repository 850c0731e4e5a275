//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Forwarding of agent log events to the broker."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Log events at or above a level are queued by a `tracing` layer and
//! published by a background task. The queue is bounded; when it is full,
//! records are dropped rather than slowing the caller down. Events emitted by
//! the MQTT client and by this crate are never forwarded, so publishing a
//! record can not produce further records.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::qos::DeliveryGuarantee;
use crate::transport::{MqttTransport, MqttTransportExt};

const SILENCED_TARGETS: [&str; 2] = ["rumqttc", "r_fleet_msg"];

/// One forwarded log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Process (service) name.
    pub process: String,
    /// Upper-case level name.
    pub level: String,
    /// Rendered message and fields.
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Event target (module path).
    pub target: String,
    /// Rendered `error` field, when the event carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Build a forwarding layer and the queue that drains it.
pub fn log_forwarder(
    process: impl Into<String>,
    level: Level,
    capacity: usize,
) -> (LogForwardLayer, LogForwardQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        LogForwardLayer {
            process: Arc::from(process.into()),
            level,
            tx,
        },
        LogForwardQueue { rx },
    )
}

/// `tracing` layer feeding [`LogForwardQueue`].
pub struct LogForwardLayer {
    process: Arc<str>,
    level: Level,
    tx: mpsc::Sender<LogRecord>,
}

impl<S: Subscriber> Layer<S> for LogForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // `Level` orders verbosity upwards: TRACE > DEBUG > ... > ERROR
        if *metadata.level() > self.level {
            return;
        }
        let target = metadata.target();
        if SILENCED_TARGETS
            .iter()
            .any(|silenced| target.starts_with(silenced))
        {
            return;
        }
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let exception = visitor.error.take();
        let record = LogRecord {
            process: self.process.to_string(),
            level: metadata.level().to_string(),
            message: visitor.render(),
            timestamp: Utc::now().timestamp_millis(),
            target: target.to_owned(),
            exception,
        };
        let _ = self.tx.try_send(record);
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: String,
    error: Option<String>,
}

impl RecordVisitor {
    fn render(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "error" => self.error = Some(value.to_owned()),
            name => {
                if !self.fields.is_empty() {
                    self.fields.push(' ');
                }
                let _ = write!(self.fields, "{}={}", name, value);
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{:?}", value);
            }
            "error" => self.error = Some(format!("{:?}", value)),
            name => {
                if !self.fields.is_empty() {
                    self.fields.push(' ');
                }
                let _ = write!(self.fields, "{}={:?}", name, value);
            }
        }
    }
}

/// Receiving half of the forwarder.
pub struct LogForwardQueue {
    rx: mpsc::Receiver<LogRecord>,
}

impl LogForwardQueue {
    /// Publish queued records to `topic` until every layer handle is gone.
    pub fn spawn(mut self, transport: Arc<dyn MqttTransport>, topic: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(record) = self.rx.recv().await {
                // failures are not logged: that would feed the queue again
                let _ = transport
                    .publish_json(&topic, DeliveryGuarantee::ExactlyOnce, &record)
                    .await;
            }
        })
    }

    /// Take the next queued record without publishing it.
    pub fn try_next(&mut self) -> Option<LogRecord> {
        self.rx.try_recv().ok()
    }
}
