//! ---
//! fleet_section: "06-security-access-control"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Bootstrap and thing-bound device identities."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use rand::RngCore;
use r_fleet_persistence::StoredIdentity;

use crate::{ProvisioningError, Result};

/// Random bytes behind a bootstrap client id; hex encoding doubles the length.
const BOOTSTRAP_ID_BYTES: usize = 64;

/// Random 128 character client id for the anonymous bootstrap session.
pub fn bootstrap_client_id() -> String {
    let mut bytes = [0u8; BOOTSTRAP_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Certificate id: the part of the certificate ARN after its last `/`.
pub fn certificate_id_from_arn(arn: &str) -> Result<String> {
    match arn.rsplit_once('/') {
        Some((_, id)) if !id.is_empty() => Ok(id.to_owned()),
        _ => Err(ProvisioningError::InvalidResponse(format!(
            "certificate arn {arn:?} has no id"
        ))),
    }
}

/// Identity produced by a completed provisioning exchange.
#[derive(Clone)]
pub struct DeviceIdentity {
    /// Client id used for the bootstrap session.
    pub bootstrap_client_id: String,
    /// Remote ARN of the issued certificate.
    pub certificate_arn: String,
    /// Certificate id derived from the ARN.
    pub certificate_id: String,
    /// Issued certificate.
    pub certificate_pem: String,
    /// Private key generated on the device.
    pub private_key_pem: String,
    /// Thing name, the certificate's common name.
    pub thing_name: String,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("thing_name", &self.thing_name)
            .field("certificate_id", &self.certificate_id)
            .field("certificate_arn", &self.certificate_arn)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Files that make up the persisted identity.
    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            thing_name: self.thing_name.clone(),
            certificate_id: self.certificate_id.clone(),
            certificate_pem: self.certificate_pem.clone(),
            private_key_pem: self.private_key_pem.clone(),
        }
    }
}
