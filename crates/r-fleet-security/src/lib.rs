//! ---
//! fleet_section: "06-security-access-control"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Device identity, key material and certificate provisioning."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
#![warn(missing_docs)]

use r_fleet_msg::MessagingError;
use r_fleet_persistence::PersistenceError;

pub mod certificates;
pub mod identity;
pub mod provisioning;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

/// Result alias used throughout the security crate.
pub type Result<T> = std::result::Result<T, ProvisioningError>;

/// Failure modes of key generation and the provisioning exchange.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    /// Key, CSR or certificate handling failed.
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),
    /// A certificate lacks the expected content.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    /// The remote side refused a provisioning phase.
    #[error("provisioning phase {phase} rejected: {payload}")]
    Rejected {
        /// `1` for certificate issuance, `2` for thing binding.
        phase: u8,
        /// Rejection body.
        payload: serde_json::Value,
    },
    /// An accepted response lacks required fields.
    #[error("malformed provisioning response: {0}")]
    InvalidResponse(String),
    /// Broker connection, subscription or correlation failure.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    /// The identity could not be stored.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// Wrapper for IO errors while reading bootstrap credentials.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub use certificates::{certificate_common_name, generate_request, CertificateRequest};
pub use identity::{bootstrap_client_id, certificate_id_from_arn, DeviceIdentity};
pub use provisioning::{
    ProvisioningExchange, ProvisioningSettings, RumqttConnector, TransportConnector,
};
