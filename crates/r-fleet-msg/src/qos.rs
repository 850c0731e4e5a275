//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Delivery guarantees and their MQTT mapping."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// Delivery guarantees supported by the messaging subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// QoS 0, fire and forget.
    AtMostOnce,
    /// QoS 1, acknowledged by PUBACK.
    #[default]
    AtLeastOnce,
    /// QoS 2, four-way handshake.
    ExactlyOnce,
}

impl DeliveryGuarantee {
    /// Numeric MQTT QoS level.
    pub fn level(self) -> u8 {
        match self {
            DeliveryGuarantee::AtMostOnce => 0,
            DeliveryGuarantee::AtLeastOnce => 1,
            DeliveryGuarantee::ExactlyOnce => 2,
        }
    }
}

impl From<DeliveryGuarantee> for rumqttc::QoS {
    fn from(value: DeliveryGuarantee) -> Self {
        match value {
            DeliveryGuarantee::AtMostOnce => rumqttc::QoS::AtMostOnce,
            DeliveryGuarantee::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            DeliveryGuarantee::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for DeliveryGuarantee {
    fn from(value: rumqttc::QoS) -> Self {
        match value {
            rumqttc::QoS::AtMostOnce => DeliveryGuarantee::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => DeliveryGuarantee::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => DeliveryGuarantee::ExactlyOnce,
        }
    }
}
