//! ---
//! fleet_section: "06-security-access-control"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Key pair, CSR and certificate subject handling."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, DnValue, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};

use crate::{ProvisioningError, Result};

/// Freshly generated key pair and the signing request for it.
#[derive(Clone)]
pub struct CertificateRequest {
    /// PEM encoded PKCS#10 request.
    pub csr_pem: String,
    /// PEM encoded private key; never leaves the device.
    pub private_key_pem: String,
}

impl std::fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("csr_pem", &self.csr_pem)
            .finish_non_exhaustive()
    }
}

/// Generate an ECDSA P-256 key pair and a CSR for `C={country}, CN={common_name}`.
pub fn generate_request(country: &str, common_name: &str) -> Result<CertificateRequest> {
    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CountryName, country);
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let certificate = Certificate::from_params(params)?;
    Ok(CertificateRequest {
        csr_pem: certificate.serialize_request_pem()?,
        private_key_pem: certificate.serialize_private_key_pem(),
    })
}

/// Subject common name of a PEM certificate.
pub fn certificate_common_name(certificate_pem: &str) -> Result<String> {
    // the key pair is only needed to satisfy the parser; the subject is what we read
    let placeholder = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?;
    let params = CertificateParams::from_ca_cert_pem(certificate_pem, placeholder)?;
    match params.distinguished_name.get(&DnType::CommonName) {
        Some(DnValue::Utf8String(name)) | Some(DnValue::PrintableString(name)) => {
            let name = name.trim();
            if name.is_empty() {
                Err(ProvisioningError::InvalidCertificate(
                    "empty subject common name".into(),
                ))
            } else {
                Ok(name.to_owned())
            }
        }
        Some(_) => Err(ProvisioningError::InvalidCertificate(
            "unsupported common name encoding".into(),
        )),
        None => Err(ProvisioningError::InvalidCertificate(
            "certificate has no subject common name".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DevAuthority;

    #[test]
    fn request_is_pem_encoded() {
        let request = generate_request("US", "r-fleet").unwrap();
        assert!(request
            .csr_pem
            .starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(request.private_key_pem.contains("PRIVATE KEY"));
        assert!(!format!("{request:?}").contains("PRIVATE KEY"));
    }

    #[test]
    fn common_name_comes_from_issued_certificate() {
        let authority = DevAuthority::new().unwrap();
        let request = generate_request("US", "r-fleet").unwrap();
        let issued = authority
            .sign_request(&request.csr_pem, "4c1e7f3a-thing")
            .unwrap();
        assert_eq!(certificate_common_name(&issued).unwrap(), "4c1e7f3a-thing");
    }

    #[test]
    fn garbage_is_not_a_certificate() {
        assert!(certificate_common_name("not a certificate").is_err());
    }
}
