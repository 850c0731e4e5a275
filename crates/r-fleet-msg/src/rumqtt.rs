//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "rumqttc-backed transport binding."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::metrics::MessagingMetrics;
use crate::qos::DeliveryGuarantee;
use crate::transport::{await_ack, AckKind, AckOutcome, AckTable, MqttTransport};
use crate::types::{ConnectionState, InboundMessage};
use crate::{MessagingError, Result};

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const MAX_PACKET_SIZE: usize = 256 * 1024;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// PEM material for mutual TLS.
#[derive(Clone)]
pub struct TlsCredentials {
    /// Trusted root certificate(s).
    pub ca: Vec<u8>,
    /// Client certificate.
    pub certificate: Vec<u8>,
    /// Client private key.
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCredentials")
            .field("ca_len", &self.ca.len())
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

impl TlsCredentials {
    /// Read the three PEM files.
    pub fn from_files(ca: &Path, certificate: &Path, private_key: &Path) -> Result<Self> {
        Ok(Self {
            ca: std::fs::read(ca)?,
            certificate: std::fs::read(certificate)?,
            private_key: std::fs::read(private_key)?,
        })
    }
}

/// Connection parameters for [`RumqttTransport`].
#[derive(Debug, Clone)]
pub struct RumqttSettings {
    /// MQTT client identifier.
    pub client_id: String,
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Keep-alive interval (at least five seconds).
    pub keep_alive: Duration,
    /// Request queue and inbound fan-out capacity.
    pub capacity: usize,
    /// Mutual TLS material; plain TCP when absent.
    pub tls: Option<TlsCredentials>,
}

impl RumqttSettings {
    /// Settings with defaults for everything but the endpoint and identity.
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(30),
            capacity: 64,
            tls: None,
        }
    }

    /// Attach TLS credentials.
    pub fn with_tls(mut self, tls: TlsCredentials) -> Self {
        self.tls = Some(tls);
        self
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let Some(tls) = &self.tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: tls.ca.clone(),
                alpn: None,
                client_auth: Some((tls.certificate.clone(), tls.private_key.clone())),
            }));
        }
        options
    }
}

/// Transport binding over a rumqttc client.
///
/// The event loop runs in its own task: it reconnects with exponential
/// backoff, publishes connection state on a watch channel, fans inbound
/// publishes out on a broadcast channel and routes SUBACK/UNSUBACK packets
/// to the waiting request by packet id.
pub struct RumqttTransport {
    client: AsyncClient,
    client_id: String,
    acks: Arc<AckTable>,
    inbound: broadcast::Sender<InboundMessage>,
    connection: watch::Receiver<ConnectionState>,
    stopping: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<MessagingMetrics>,
}

impl RumqttTransport {
    /// Create the client and start driving its event loop.
    pub fn spawn(settings: RumqttSettings, metrics: Option<MessagingMetrics>) -> Self {
        let capacity = settings.capacity.max(1);
        let (client, eventloop) = AsyncClient::new(settings.options(), capacity);
        let (inbound, _) = broadcast::channel(capacity.max(16) * 4);
        let (state_tx, connection) = watch::channel(ConnectionState::Disconnected);
        let acks = Arc::new(AckTable::default());
        let stopping = Arc::new(AtomicBool::new(false));

        info!(client_id = %settings.client_id, host = %settings.host, port = settings.port, tls = settings.tls.is_some(), "starting mqtt transport");
        let task = tokio::spawn(drive(
            eventloop,
            acks.clone(),
            inbound.clone(),
            state_tx,
            stopping.clone(),
            metrics.clone(),
        ));

        Self {
            client,
            client_id: settings.client_id,
            acks,
            inbound,
            connection,
            stopping,
            task: Mutex::new(Some(task)),
            metrics,
        }
    }

    /// Client identifier of this session.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

async fn drive(
    mut eventloop: EventLoop,
    acks: Arc<AckTable>,
    inbound: broadcast::Sender<InboundMessage>,
    state: watch::Sender<ConnectionState>,
    stopping: Arc<AtomicBool>,
    metrics: Option<MessagingMetrics>,
) {
    let mut session = 0u64;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    session += 1;
                    backoff = INITIAL_BACKOFF;
                    info!(session, session_present = ack.session_present, "mqtt connected");
                    state.send_replace(ConnectionState::Connected { session });
                } else {
                    warn!(code = ?ack.code, "mqtt connection refused");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "inbound publish");
                if let Some(metrics) = &metrics {
                    metrics.observe_received();
                }
                let _ = inbound.send(InboundMessage::new(publish.topic, publish.payload));
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let refused = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let outcome = if refused {
                    AckOutcome::Refused
                } else {
                    AckOutcome::Granted
                };
                acks.resolve(AckKind::Subscribe, ack.pkid, outcome);
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                acks.resolve(AckKind::Unsubscribe, ack.pkid, AckOutcome::Granted);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                acks.assign(AckKind::Subscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                acks.assign(AckKind::Unsubscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt disconnect sent");
                state.send_replace(ConnectionState::Disconnected);
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                acks.fail_all("connection lost");
                state.send_replace(ConnectionState::Disconnected);
                if stopping.load(Ordering::SeqCst) {
                    debug!(error = %err, "mqtt event loop stopped");
                    break;
                }
                warn!(error = %err, retry_in = ?backoff, "mqtt connection error");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn client_error(err: rumqttc::ClientError) -> MessagingError {
    MessagingError::Transport(err.to_string())
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn publish(&self, topic: &str, qos: DeliveryGuarantee, payload: Bytes) -> Result<()> {
        let result = self
            .client
            .publish(topic, qos.into(), false, payload.to_vec())
            .await
            .map_err(client_error);
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(()) => metrics.observe_sent(),
                Err(_) => metrics.observe_dropped(),
            }
        }
        result
    }

    async fn subscribe(&self, filter: &str, qos: DeliveryGuarantee) -> Result<()> {
        let rx = self.acks.register(AckKind::Subscribe, filter, || {
            self.client
                .try_subscribe(filter, qos.into())
                .map_err(client_error)
        })?;
        await_ack(rx, AckKind::Subscribe, filter).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let rx = self.acks.register(AckKind::Unsubscribe, filter, || {
            self.client.try_unsubscribe(filter).map_err(client_error)
        })?;
        await_ack(rx, AckKind::Unsubscribe, filter).await
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    async fn disconnect(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let sent = self.client.disconnect().await.map_err(client_error);
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.acks.fail_all("transport closed");
        sent
    }

    fn name(&self) -> &'static str {
        "rumqttc"
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_is_clamped() {
        let mut settings = RumqttSettings::new("client", "localhost", 1883);
        settings.keep_alive = Duration::from_secs(1);
        let options = settings.options();
        assert_eq!(options.keep_alive(), MIN_KEEP_ALIVE);
        assert_eq!(options.client_id(), "client");
    }

    #[test]
    fn credentials_debug_hides_key() {
        let creds = TlsCredentials {
            ca: b"ca".to_vec(),
            certificate: b"cert".to_vec(),
            private_key: b"secret".to_vec(),
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("secret"));
    }
}
