//! ---
//! fleet_section: "15-testing-qa-runbook"
//! fleet_subsection: "integration-tests"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Provisioning scenarios: failed binding, retry and identity replacement."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::time::Duration;

use r_fleet_msg::TlsCredentials;
use r_fleet_persistence::IdentityStore;
use r_fleet_security::testing::{LoopbackConnector, ProvisioningService};
use r_fleet_security::{
    certificate_common_name, ProvisioningError, ProvisioningExchange, ProvisioningSettings,
};

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
async fn failed_binding_leaves_device_ready_for_retry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = IdentityStore::new(dir.path().join("aws"));

    let refusing = ProvisioningService::new("fleet").expect("service");
    refusing.reject_phase(2);
    let err = ProvisioningExchange::new(
        LoopbackConnector::new(refusing.clone()),
        settings(),
        store.clone(),
    )
    .run()
    .await
    .expect_err("binding refused");
    assert!(matches!(err, ProvisioningError::Rejected { phase: 2, .. }));
    assert!(refusing.bound().is_empty());
    assert!(!store.exists());

    let service = ProvisioningService::new("fleet").expect("service");
    let identity = ProvisioningExchange::new(
        LoopbackConnector::new(service.clone()),
        settings(),
        store.clone(),
    )
    .run()
    .await
    .expect("second attempt");

    assert_eq!(service.bound(), vec![identity.thing_name.clone()]);
    let stored = store.load().expect("stored identity");
    assert_eq!(stored.certificate_id, service.certificate_id());
    assert_eq!(
        certificate_common_name(&stored.certificate_pem).expect("common name"),
        identity.thing_name
    );
}

#[tokio::test]
async fn reprovisioning_moves_previous_identity_aside() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = IdentityStore::new(dir.path().join("aws"));

    let first = ProvisioningService::new("fleet").expect("service");
    ProvisioningExchange::new(LoopbackConnector::new(first.clone()), settings(), store.clone())
        .run()
        .await
        .expect("first provisioning");

    let second = ProvisioningService::new("fleet").expect("service");
    let identity =
        ProvisioningExchange::new(LoopbackConnector::new(second.clone()), settings(), store.clone())
            .run()
            .await
            .expect("second provisioning");

    assert_eq!(store.load().expect("identity").thing_name, identity.thing_name);
    assert_ne!(first.thing_name(), second.thing_name());
    let entries = std::fs::read_dir(dir.path()).expect("list").count();
    assert_eq!(entries, 2, "current identity plus the superseded one");
}
