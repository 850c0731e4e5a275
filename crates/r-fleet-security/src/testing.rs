//! ---
//! fleet_section: "06-security-access-control"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "In-process certificate authority and provisioning service for tests."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Test doubles for the provisioning exchange.
//!
//! [`ProvisioningService`] plays the cloud side of both phases on top of
//! [`LoopbackTransport`] sessions handed out by [`LoopbackConnector`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use r_fleet_msg::{topics, LoopbackTransport, MqttTransport, PublishedMessage, TlsCredentials};
use rcgen::{
    Certificate, CertificateParams, CertificateSigningRequest, DistinguishedName, DnType,
    PKCS_ECDSA_P256_SHA256,
};
use serde_json::{json, Value};

use crate::provisioning::TransportConnector;
use crate::Result;

/// Self-signed authority that signs device CSRs.
pub struct DevAuthority {
    ca: Certificate,
}

impl DevAuthority {
    /// Generate a fresh authority.
    pub fn new() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, "R-Fleet Dev CA");
        params.alg = &PKCS_ECDSA_P256_SHA256;
        Ok(Self {
            ca: Certificate::from_params(params)?,
        })
    }

    /// Authority certificate.
    pub fn certificate_pem(&self) -> Result<String> {
        Ok(self.ca.serialize_pem()?)
    }

    /// Sign `csr_pem`, replacing its subject common name with `common_name`.
    pub fn sign_request(&self, csr_pem: &str, common_name: &str) -> Result<String> {
        let mut csr = CertificateSigningRequest::from_pem(csr_pem)?;
        csr.params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        Ok(csr.serialize_pem_with_signer(&self.ca)?)
    }
}

#[derive(Default)]
struct ServiceState {
    sessions: Vec<String>,
    rejected: HashSet<u8>,
    silent: HashSet<u8>,
    bound: Vec<String>,
}

struct ServiceInner {
    topic_prefix: String,
    authority: DevAuthority,
    certificate_id: String,
    thing_name: String,
    state: Mutex<ServiceState>,
}

/// Cloud side of the exchange: issues certificates and binds things.
#[derive(Clone)]
pub struct ProvisioningService {
    inner: Arc<ServiceInner>,
}

impl ProvisioningService {
    /// Service answering on `{topic_prefix}` provisioning topics.
    pub fn new(topic_prefix: impl Into<String>) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(ServiceInner {
                topic_prefix: topic_prefix.into(),
                authority: DevAuthority::new()?,
                certificate_id: uuid::Uuid::new_v4().simple().to_string(),
                thing_name: uuid::Uuid::new_v4().to_string(),
                state: Mutex::new(ServiceState::default()),
            }),
        })
    }

    /// Answer phase `phase` on the rejected topic.
    pub fn reject_phase(&self, phase: u8) {
        self.inner.state.lock().rejected.insert(phase);
    }

    /// Never answer phase `phase`.
    pub fn silence_phase(&self, phase: u8) {
        self.inner.state.lock().silent.insert(phase);
    }

    /// Certificate id embedded in issued ARNs.
    pub fn certificate_id(&self) -> &str {
        &self.inner.certificate_id
    }

    /// Thing name issued certificates carry.
    pub fn thing_name(&self) -> &str {
        &self.inner.thing_name
    }

    /// Client ids of every session opened, in order.
    pub fn sessions(&self) -> Vec<String> {
        self.inner.state.lock().sessions.clone()
    }

    /// Things that completed phase 2.
    pub fn bound(&self) -> Vec<String> {
        self.inner.state.lock().bound.clone()
    }

    fn answer(&self, transport: &LoopbackTransport, message: &PublishedMessage) {
        let request = message.json();
        let token = request
            .get("clientToken")
            .cloned()
            .unwrap_or(Value::Null);
        let prefix = &self.inner.topic_prefix;
        let phase = if message.topic.ends_with("/provision")
            && message
                .topic
                .starts_with(&format!("$aws/rules/{prefix}/clients/"))
        {
            1
        } else if message.topic == topics::provision_thing(prefix, &self.inner.thing_name) {
            2
        } else {
            return;
        };

        let (rejected, silent) = {
            let state = self.inner.state.lock();
            (state.rejected.contains(&phase), state.silent.contains(&phase))
        };
        if silent {
            return;
        }
        let base = topics::response_base(&message.topic);
        if rejected {
            transport.inject_json(
                &topics::rejected(base),
                &json!({"clientToken": token, "message": "refused"}),
            );
            return;
        }

        let body = match phase {
            1 => {
                let csr = request.get("csr").and_then(Value::as_str).unwrap_or_default();
                match self.inner.authority.sign_request(csr, &self.inner.thing_name) {
                    Ok(pem) => json!({
                        "clientToken": token,
                        "arn": format!(
                            "arn:aws:iot:us-east-1:123456789012:cert/{}",
                            self.inner.certificate_id
                        ),
                        "pem": pem,
                    }),
                    Err(err) => {
                        transport.inject_json(
                            &topics::rejected(base),
                            &json!({"clientToken": token, "message": err.to_string()}),
                        );
                        return;
                    }
                }
            }
            _ => {
                self.inner
                    .state
                    .lock()
                    .bound
                    .push(self.inner.thing_name.clone());
                json!({"clientToken": token})
            }
        };
        transport.inject_json(&topics::accepted(base), &body);
    }
}

/// Hands out connected loopback sessions served by a [`ProvisioningService`].
#[derive(Clone)]
pub struct LoopbackConnector {
    service: ProvisioningService,
}

impl LoopbackConnector {
    /// Connector for `service`.
    pub fn new(service: ProvisioningService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TransportConnector for LoopbackConnector {
    async fn connect(
        &self,
        client_id: &str,
        _credentials: TlsCredentials,
    ) -> Result<Arc<dyn MqttTransport>> {
        self.service
            .inner
            .state
            .lock()
            .sessions
            .push(client_id.to_owned());
        let transport = LoopbackTransport::connected();
        let mut outbound = transport.outbound();
        let service = self.service.clone();
        let responder = transport.clone();
        tokio::spawn(async move {
            while let Ok(message) = outbound.recv().await {
                service.answer(&responder, &message);
                if responder.is_closed() {
                    break;
                }
            }
        });
        Ok(Arc::new(transport))
    }
}
