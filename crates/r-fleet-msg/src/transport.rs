//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Transport binding abstraction and loopback binding."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, watch};

use crate::qos::DeliveryGuarantee;
use crate::topics;
use crate::types::{ConnectionState, InboundMessage};
use crate::{MessagingError, Result};

/// Persistent, auto-reconnecting publish/subscribe connection.
///
/// Inbound traffic is fanned out through [`MqttTransport::messages`]; each
/// consumer filters for the topics it cares about. Subscribe and unsubscribe
/// resolve once the broker acknowledges them, without any timeout of their
/// own (see [`crate::waiters`]).
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Queue a message for publication.
    async fn publish(&self, topic: &str, qos: DeliveryGuarantee, payload: Bytes) -> Result<()>;
    /// Subscribe and wait for the broker acknowledgement.
    async fn subscribe(&self, filter: &str, qos: DeliveryGuarantee) -> Result<()>;
    /// Unsubscribe and wait for the broker acknowledgement.
    async fn unsubscribe(&self, filter: &str) -> Result<()>;
    /// New receiver of every inbound message from now on.
    fn messages(&self) -> broadcast::Receiver<InboundMessage>;
    /// Connection state observer.
    fn connection(&self) -> watch::Receiver<ConnectionState>;
    /// Close the session; the binding does not reconnect afterwards.
    async fn disconnect(&self) -> Result<()>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// JSON helpers available on every transport.
#[async_trait]
pub trait MqttTransportExt: MqttTransport {
    /// Serialize `payload` as JSON and publish it.
    async fn publish_json<T>(&self, topic: &str, qos: DeliveryGuarantee, payload: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let body = serde_json::to_vec(payload)?;
        self.publish(topic, qos, Bytes::from(body)).await
    }

    /// Publish an empty JSON object, the request body of most protocol calls.
    async fn publish_empty(&self, topic: &str, qos: DeliveryGuarantee) -> Result<()> {
        self.publish(topic, qos, Bytes::from_static(b"{}")).await
    }
}

impl<T: MqttTransport + ?Sized> MqttTransportExt for T {}

/// Acknowledged packet kinds that are multiplexed by packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum AckKind {
    Subscribe,
    Unsubscribe,
}

/// Outcome of an acknowledged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    Granted,
    Refused,
    Lost(String),
}

struct PendingAck {
    filter: String,
    tx: oneshot::Sender<AckOutcome>,
}

#[derive(Default)]
struct AckState {
    queued: HashMap<AckKind, VecDeque<PendingAck>>,
    inflight: HashMap<(AckKind, u16), PendingAck>,
}

/// Routes broker acknowledgements to the request that caused them.
///
/// Requests are queued in issue order; when the client reports the packet id
/// it assigned to the outgoing packet, the head of the queue is bound to that
/// id and resolved by the matching SUBACK/UNSUBACK.
#[derive(Default)]
pub(crate) struct AckTable {
    state: Mutex<AckState>,
}

impl AckTable {
    /// Queue a request and issue it while holding the table lock, so the
    /// queue order matches the order packets reach the client.
    pub(crate) fn register<F>(
        &self,
        kind: AckKind,
        filter: &str,
        issue: F,
    ) -> Result<oneshot::Receiver<AckOutcome>>
    where
        F: FnOnce() -> Result<()>,
    {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        let queue = state.queued.entry(kind).or_default();
        queue.push_back(PendingAck {
            filter: filter.to_owned(),
            tx,
        });
        if let Err(err) = issue() {
            queue.pop_back();
            return Err(err);
        }
        Ok(rx)
    }

    /// Bind the oldest queued request of `kind` to `pkid`.
    ///
    /// A live binding for `pkid` means the packet was resent and is kept. A
    /// binding whose waiter already gave up is stale: the client reused the
    /// id for the next packet.
    pub(crate) fn assign(&self, kind: AckKind, pkid: u16) {
        let mut state = self.state.lock();
        match state.inflight.get(&(kind, pkid)).map(|bound| bound.tx.is_closed()) {
            Some(false) => return,
            Some(true) => {
                if let Some(stale) = state.inflight.remove(&(kind, pkid)) {
                    tracing::trace!(?kind, pkid, filter = %stale.filter, "stale ack binding evicted");
                }
            }
            None => {}
        }
        let next = state.queued.get_mut(&kind).and_then(VecDeque::pop_front);
        if let Some(pending) = next {
            tracing::trace!(?kind, pkid, filter = %pending.filter, "ack bound to packet id");
            state.inflight.insert((kind, pkid), pending);
        }
    }

    /// Resolve the request bound to `pkid`.
    pub(crate) fn resolve(&self, kind: AckKind, pkid: u16, outcome: AckOutcome) {
        let pending = self.state.lock().inflight.remove(&(kind, pkid));
        if let Some(pending) = pending {
            let _ = pending.tx.send(outcome);
        }
    }

    /// Fail every outstanding request, used when the session is lost.
    pub(crate) fn fail_all(&self, reason: &str) {
        let mut state = self.state.lock();
        let inflight = std::mem::take(&mut state.inflight);
        let queued = std::mem::take(&mut state.queued);
        drop(state);
        for pending in inflight
            .into_values()
            .chain(queued.into_values().flatten())
        {
            let _ = pending.tx.send(AckOutcome::Lost(reason.to_owned()));
        }
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.inflight.len() + state.queued.values().map(VecDeque::len).sum::<usize>()
    }
}

/// Await an acknowledgement registered in an [`AckTable`].
pub(crate) async fn await_ack(
    rx: oneshot::Receiver<AckOutcome>,
    kind: AckKind,
    filter: &str,
) -> Result<()> {
    match rx.await {
        Ok(AckOutcome::Granted) => Ok(()),
        Ok(AckOutcome::Refused) => Err(MessagingError::SubscribeRefused(filter.to_owned())),
        Ok(AckOutcome::Lost(reason)) => Err(MessagingError::Transport(format!(
            "{:?} of {} lost: {}",
            kind, filter, reason
        ))),
        Err(_) => Err(MessagingError::Closed),
    }
}

/// A message handed to the loopback binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic published to.
    pub topic: String,
    /// Requested delivery guarantee.
    pub qos: DeliveryGuarantee,
    /// Raw payload.
    pub payload: Bytes,
}

impl PublishedMessage {
    /// Payload decoded as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// How the loopback binding answers subscribe/unsubscribe requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Acknowledge immediately.
    #[default]
    Immediate,
    /// Never acknowledge; requests hang until the caller gives up.
    Never,
    /// Refuse subscriptions; unsubscribes are acknowledged.
    Refuse,
}

#[derive(Default)]
struct LoopbackState {
    subscriptions: HashMap<String, usize>,
    published: Vec<PublishedMessage>,
    subscribe_log: Vec<String>,
    unsubscribe_log: Vec<String>,
    ack_mode: AckMode,
    fail_publish: bool,
    session: u64,
    closed: bool,
}

/// In-process transport binding acting as its own broker.
///
/// Publishes are recorded and fanned out to observers of
/// [`LoopbackTransport::outbound`]; [`LoopbackTransport::inject`] delivers a
/// message to local subscribers exactly as the broker would, i.e. only when a
/// matching subscription is active.
#[derive(Clone)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
    inbound: broadcast::Sender<InboundMessage>,
    outbound: broadcast::Sender<PublishedMessage>,
    connection: Arc<watch::Sender<ConnectionState>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Create a disconnected loopback binding.
    pub fn new() -> Self {
        let (inbound, _) = broadcast::channel(256);
        let (outbound, _) = broadcast::channel(256);
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: Arc::new(Mutex::new(LoopbackState::default())),
            inbound,
            outbound,
            connection: Arc::new(connection),
        }
    }

    /// Create a binding that is already connected.
    pub fn connected() -> Self {
        let transport = Self::new();
        transport.connect();
        transport
    }

    /// Simulate a successful (re)connect.
    pub fn connect(&self) -> u64 {
        let session = {
            let mut state = self.state.lock();
            state.session += 1;
            // a clean session starts without subscriptions
            state.subscriptions.clear();
            state.session
        };
        self.connection
            .send_replace(ConnectionState::Connected { session });
        session
    }

    /// Simulate a lost connection.
    pub fn drop_connection(&self) {
        self.connection.send_replace(ConnectionState::Disconnected);
    }

    /// Change how subscribe/unsubscribe requests are acknowledged.
    pub fn set_ack_mode(&self, mode: AckMode) {
        self.state.lock().ack_mode = mode;
    }

    /// Make every publish fail with a transport error.
    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }

    /// Observe every publish from now on.
    pub fn outbound(&self) -> broadcast::Receiver<PublishedMessage> {
        self.outbound.subscribe()
    }

    /// Deliver a message to matching subscribers; returns whether any matched.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let matched = {
            let state = self.state.lock();
            state
                .subscriptions
                .keys()
                .any(|filter| topics::matches(filter, topic))
        };
        if matched {
            let _ = self.inbound.send(InboundMessage::new(topic, payload));
        }
        matched
    }

    /// Deliver a JSON message to matching subscribers.
    pub fn inject_json(&self, topic: &str, payload: &serde_json::Value) -> bool {
        self.inject(topic, payload.to_string())
    }

    /// Every message published so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Messages published to exactly `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// Forget recorded publishes.
    pub fn clear_published(&self) {
        self.state.lock().published.clear();
    }

    /// Currently active subscription filters, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.state.lock().subscriptions.keys().cloned().collect();
        filters.sort();
        filters
    }

    /// Every subscribe request received, in order.
    pub fn subscribe_log(&self) -> Vec<String> {
        self.state.lock().subscribe_log.clone()
    }

    /// Every unsubscribe request received, in order.
    pub fn unsubscribe_log(&self) -> Vec<String> {
        self.state.lock().unsubscribe_log.clone()
    }

    /// Whether `disconnect` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl MqttTransport for LoopbackTransport {
    async fn publish(&self, topic: &str, qos: DeliveryGuarantee, payload: Bytes) -> Result<()> {
        let message = PublishedMessage {
            topic: topic.to_owned(),
            qos,
            payload,
        };
        {
            let mut state = self.state.lock();
            if state.fail_publish || state.closed {
                return Err(MessagingError::Transport(format!(
                    "loopback publish to {} failed",
                    topic
                )));
            }
            state.published.push(message.clone());
        }
        let _ = self.outbound.send(message);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: DeliveryGuarantee) -> Result<()> {
        let mode = {
            let mut state = self.state.lock();
            state.subscribe_log.push(filter.to_owned());
            if state.ack_mode == AckMode::Immediate {
                // MQTT subscriptions are idempotent per filter; the count only
                // tracks how often the filter was requested.
                *state.subscriptions.entry(filter.to_owned()).or_default() += 1;
            }
            state.ack_mode
        };
        match mode {
            AckMode::Immediate => Ok(()),
            AckMode::Refuse => Err(MessagingError::SubscribeRefused(filter.to_owned())),
            AckMode::Never => std::future::pending().await,
        }
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let mode = {
            let mut state = self.state.lock();
            state.unsubscribe_log.push(filter.to_owned());
            if state.ack_mode != AckMode::Never {
                state.subscriptions.remove(filter);
            }
            state.ack_mode
        };
        match mode {
            AckMode::Never => std::future::pending().await,
            _ => Ok(()),
        }
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().closed = true;
        self.connection.send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}
