//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Connection announcements and broker presence logging."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use r_fleet_logging::{fleet_info, fleet_warn, LogContext};
use r_fleet_msg::topics::{self, ShadowTopics};
use r_fleet_msg::{
    subscribe_and_wait, DeliveryGuarantee, InboundMessage, MqttTransport, MqttTransportExt,
    CLIENT_TOKEN_FIELD,
};
use rand::RngCore;
use serde_json::{json, Value};

use crate::reconciler::Reconciler;

/// Desired-state announcement published on every connect.
pub fn announcement() -> Value {
    let mut nonce = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut nonce);
    json!({
        "state": {
            "desired": {
                "connected": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "random": hex::encode(nonce),
            }
        },
        CLIENT_TOKEN_FIELD: uuid::Uuid::new_v4().to_string(),
    })
}

/// Announces each new session on a shadow and logs broker presence changes.
pub struct PresenceAnnouncer {
    thing: String,
    state_topic: String,
    update_topic: String,
    transport: Arc<dyn MqttTransport>,
    ack_timeout: Duration,
}

impl PresenceAnnouncer {
    pub fn new(
        thing: impl Into<String>,
        shadow: &str,
        transport: Arc<dyn MqttTransport>,
    ) -> Self {
        let thing = thing.into();
        Self {
            state_topic: topics::presence_state(&thing),
            update_topic: ShadowTopics::new(&thing, shadow).update(),
            thing,
            transport,
            ack_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

#[async_trait]
impl Reconciler for PresenceAnnouncer {
    fn name(&self) -> &str {
        "presence"
    }

    async fn on_connected(&mut self) -> r_fleet_msg::Result<()> {
        subscribe_and_wait(
            self.transport.as_ref(),
            &self.state_topic,
            DeliveryGuarantee::AtLeastOnce,
            self.ack_timeout,
        )
        .await?;
        self.transport
            .publish_json(
                &self.update_topic,
                DeliveryGuarantee::AtLeastOnce,
                &announcement(),
            )
            .await
    }

    async fn on_message(&mut self, message: &InboundMessage) {
        if message.topic != self.state_topic {
            return;
        }
        let context = LogContext::new().with_thing(&self.thing);
        if message.payload.as_ref() == b"1" {
            fleet_info!(context = context, "broker reports ONLINE");
        } else {
            fleet_warn!(context = context, "broker reports OFFLINE");
        }
    }
}
