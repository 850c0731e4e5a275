//! ---
//! fleet_section: "06-security-access-control"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Two-phase certificate issuance and thing binding."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Provisioning exchange.
//!
//! Phase 1 connects under a random bootstrap client id with the fleet-wide
//! bootstrap certificate and trades a locally generated CSR for a signed
//! certificate. Phase 2 reconnects as the thing named in that certificate and
//! asks the cloud side to bind it. Nothing is written to disk until both
//! phases have been accepted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r_fleet_msg::{
    connect_and_wait, topics, Correlator, MessagingError, MessagingMetrics, MqttTransport,
    RumqttSettings, RumqttTransport, TlsCredentials,
};
use r_fleet_persistence::IdentityStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::certificates::{certificate_common_name, generate_request};
use crate::identity::{bootstrap_client_id, certificate_id_from_arn, DeviceIdentity};
use crate::{ProvisioningError, Result};

/// Opens broker sessions under a given client id and certificate.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Start a session; the returned transport may still be connecting.
    async fn connect(
        &self,
        client_id: &str,
        credentials: TlsCredentials,
    ) -> Result<Arc<dyn MqttTransport>>;
}

/// Connector backed by [`RumqttTransport`].
#[derive(Clone)]
pub struct RumqttConnector {
    host: String,
    port: u16,
    keep_alive: Duration,
    capacity: usize,
    metrics: Option<MessagingMetrics>,
}

impl RumqttConnector {
    /// Connector for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(30),
            capacity: 64,
            metrics: None,
        }
    }

    /// Override keep-alive and channel capacity.
    pub fn with_session(mut self, keep_alive: Duration, capacity: usize) -> Self {
        self.keep_alive = keep_alive;
        self.capacity = capacity;
        self
    }

    /// Record transport metrics for provisioning sessions.
    pub fn with_metrics(mut self, metrics: MessagingMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl TransportConnector for RumqttConnector {
    async fn connect(
        &self,
        client_id: &str,
        credentials: TlsCredentials,
    ) -> Result<Arc<dyn MqttTransport>> {
        let mut settings =
            RumqttSettings::new(client_id, self.host.clone(), self.port).with_tls(credentials);
        settings.keep_alive = self.keep_alive;
        settings.capacity = self.capacity;
        let transport = RumqttTransport::spawn(settings, self.metrics.clone());
        Ok(Arc::new(transport))
    }
}

/// Inputs of one provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisioningSettings {
    /// Topic prefix of the rule-routed provisioning topics.
    pub topic_prefix: String,
    /// CSR subject country.
    pub country: String,
    /// CSR subject common name.
    pub common_name: String,
    /// Bootstrap credentials; the CA is reused for the thing session.
    pub bootstrap: TlsCredentials,
    /// Budget for each connection to come up.
    pub connect_timeout: Duration,
    /// Budget for each correlated response.
    pub response_timeout: Duration,
    /// Budget for subscribe/unsubscribe acknowledgements.
    pub ack_timeout: Duration,
}

impl ProvisioningSettings {
    /// Settings with the bootstrap material read from disk.
    pub fn from_files(
        topic_prefix: impl Into<String>,
        common_name: impl Into<String>,
        root_ca: &Path,
        certificate: &Path,
        private_key: &Path,
    ) -> Result<Self> {
        let bootstrap = TlsCredentials {
            ca: std::fs::read(root_ca)?,
            certificate: std::fs::read(certificate)?,
            private_key: std::fs::read(private_key)?,
        };
        Ok(Self {
            topic_prefix: topic_prefix.into(),
            country: "US".into(),
            common_name: common_name.into(),
            bootstrap,
            connect_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(15),
        })
    }
}

#[derive(Debug, Deserialize)]
struct IssuedCertificate {
    arn: String,
    pem: String,
}

/// Drives the exchange and persists the resulting identity.
pub struct ProvisioningExchange<C> {
    connector: C,
    settings: ProvisioningSettings,
    store: IdentityStore,
}

impl<C: TransportConnector> ProvisioningExchange<C> {
    /// Exchange that persists into `store`.
    pub fn new(connector: C, settings: ProvisioningSettings, store: IdentityStore) -> Self {
        Self {
            connector,
            settings,
            store,
        }
    }

    /// Identity store the exchange writes to.
    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    /// Run both phases; the identity is persisted only when both succeed.
    pub async fn run(&self) -> Result<DeviceIdentity> {
        let request = generate_request(&self.settings.country, &self.settings.common_name)?;
        let client_id = bootstrap_client_id();
        info!(client = %&client_id[..12], "provisioning: requesting certificate");

        let issued = self.issue(&client_id, &request.csr_pem).await?;
        let certificate_id = certificate_id_from_arn(&issued.arn)?;
        let thing_name = certificate_common_name(&issued.pem)?;
        info!(thing = %thing_name, certificate = %certificate_id, "provisioning: certificate issued");

        let credentials = TlsCredentials {
            ca: self.settings.bootstrap.ca.clone(),
            certificate: issued.pem.clone().into_bytes(),
            private_key: request.private_key_pem.clone().into_bytes(),
        };
        self.bind(&thing_name, credentials).await?;
        info!(thing = %thing_name, "provisioning: thing bound");

        let identity = DeviceIdentity {
            bootstrap_client_id: client_id,
            certificate_arn: issued.arn,
            certificate_id,
            certificate_pem: issued.pem,
            private_key_pem: request.private_key_pem,
            thing_name,
        };
        if let Some(previous) = self.store.persist(&identity.to_stored())? {
            warn!(previous = %previous.display(), "provisioning replaced an existing identity");
        }
        Ok(identity)
    }

    async fn issue(&self, client_id: &str, csr_pem: &str) -> Result<IssuedCertificate> {
        let topic = topics::provision_client(&self.settings.topic_prefix, client_id);
        let transport = self
            .connector
            .connect(client_id, self.settings.bootstrap.clone())
            .await?;
        let outcome = self.call(&transport, &topic, json!({ "csr": csr_pem })).await;
        close(transport.as_ref()).await;
        let payload = outcome.map_err(|err| phase_error(1, err))?;
        serde_json::from_value(payload).map_err(|err| {
            ProvisioningError::InvalidResponse(format!("certificate response: {err}"))
        })
    }

    async fn bind(&self, thing_name: &str, credentials: TlsCredentials) -> Result<()> {
        let topic = topics::provision_thing(&self.settings.topic_prefix, thing_name);
        let transport = self.connector.connect(thing_name, credentials).await?;
        let outcome = self.call(&transport, &topic, json!({})).await;
        close(transport.as_ref()).await;
        outcome.map(drop).map_err(|err| phase_error(2, err))
    }

    async fn call(
        &self,
        transport: &Arc<dyn MqttTransport>,
        topic: &str,
        payload: Value,
    ) -> r_fleet_msg::Result<Value> {
        connect_and_wait(transport.as_ref(), self.settings.connect_timeout).await?;
        let correlator =
            Correlator::new(Arc::clone(transport)).with_ack_timeout(self.settings.ack_timeout);
        correlator
            .call_accepted(topic, payload, self.settings.response_timeout)
            .await
    }
}

fn phase_error(phase: u8, err: MessagingError) -> ProvisioningError {
    match err {
        MessagingError::Rejected { payload, .. } => ProvisioningError::Rejected { phase, payload },
        other => ProvisioningError::Messaging(other),
    }
}

async fn close(transport: &dyn MqttTransport) {
    if let Err(err) = transport.disconnect().await {
        debug!(error = %err, "disconnect after provisioning phase failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LoopbackConnector, ProvisioningService};

    fn settings() -> ProvisioningSettings {
        ProvisioningSettings {
            topic_prefix: "fleet".into(),
            country: "US".into(),
            common_name: "r-fleet".into(),
            bootstrap: TlsCredentials {
                ca: b"ca".to_vec(),
                certificate: b"bootstrap".to_vec(),
                private_key: b"bootstrap-key".to_vec(),
            },
            connect_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn both_phases_accepted_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let service = ProvisioningService::new("fleet").unwrap();
        let exchange = ProvisioningExchange::new(
            LoopbackConnector::new(service.clone()),
            settings(),
            IdentityStore::new(dir.path().join("aws")),
        );

        let identity = exchange.run().await.unwrap();

        assert_eq!(identity.bootstrap_client_id.len(), 128);
        assert_eq!(identity.certificate_id, service.certificate_id());
        let sessions = service.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0], identity.bootstrap_client_id);
        assert_eq!(sessions[1], identity.thing_name);

        let stored = exchange.store().load().unwrap();
        assert_eq!(stored.thing_name, identity.thing_name);
        assert_eq!(stored.certificate_pem, identity.certificate_pem);
        assert_eq!(stored.private_key_pem, identity.private_key_pem);
    }

    #[tokio::test]
    async fn rejected_certificate_request_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = ProvisioningService::new("fleet").unwrap();
        service.reject_phase(1);
        let exchange = ProvisioningExchange::new(
            LoopbackConnector::new(service.clone()),
            settings(),
            IdentityStore::new(dir.path().join("aws")),
        );

        let err = exchange.run().await.unwrap_err();

        assert!(matches!(err, ProvisioningError::Rejected { phase: 1, .. }));
        assert_eq!(service.sessions().len(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn rejected_binding_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = ProvisioningService::new("fleet").unwrap();
        service.reject_phase(2);
        let exchange = ProvisioningExchange::new(
            LoopbackConnector::new(service.clone()),
            settings(),
            IdentityStore::new(dir.path().join("aws")),
        );

        let err = exchange.run().await.unwrap_err();

        assert!(matches!(err, ProvisioningError::Rejected { phase: 2, .. }));
        assert!(!exchange.store().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_binding_times_out_without_identity() {
        let dir = tempfile::tempdir().unwrap();
        let service = ProvisioningService::new("fleet").unwrap();
        service.silence_phase(2);
        let exchange = ProvisioningExchange::new(
            LoopbackConnector::new(service.clone()),
            settings(),
            IdentityStore::new(dir.path().join("aws")),
        );

        let err = exchange.run().await.unwrap_err();

        match err {
            ProvisioningError::Messaging(inner) => assert!(inner.is_timeout()),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!exchange.store().exists());
    }
}
