//! ---
//! fleet_section: "15-testing-qa-runbook"
//! fleet_subsection: "integration-tests"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Agent scenarios: provisioned device, job lifecycle, shadow convergence."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_fleet_common::config::AppConfig;
use r_fleet_core::{execution_payload, FleetAgent};
use r_fleet_msg::topics::{self, JobTopics, ShadowTopics};
use r_fleet_msg::{LoopbackTransport, PublishedMessage};
use r_fleet_persistence::{IdentityStore, ShadowCache};
use r_fleet_security::testing::{LoopbackConnector, ProvisioningService};
use r_fleet_security::{ProvisioningExchange, ProvisioningSettings};
use r_fleet_supervision::{ControlAction, RecordingControl};
use serde_json::json;

async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_publish(transport: &LoopbackTransport, topic: &str, count: usize) -> Vec<PublishedMessage> {
    wait_for(topic, || transport.published_to(topic).len() >= count).await;
    transport.published_to(topic)
}

fn agent_config(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.identity.directory = dir.join("aws");
    config.jobs.descriptor_dir = dir.join("jobs");
    config.shadows.cache_dir = dir.join("shadows");
    config.shadows.names.clear();
    config.tunnels.enabled = false;
    config.presence.enabled = false;
    config
}

fn provisioning_settings() -> ProvisioningSettings {
    ProvisioningSettings {
        topic_prefix: "fleet".into(),
        country: "NO".into(),
        common_name: "r-fleet".into(),
        bootstrap: r_fleet_msg::TlsCredentials {
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
async fn provisioned_device_reports_fatal_job_program() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = agent_config(dir.path());

    let service = ProvisioningService::new("fleet").expect("service");
    let identity = ProvisioningExchange::new(
        LoopbackConnector::new(service.clone()),
        provisioning_settings(),
        IdentityStore::new(&config.identity.directory),
    )
    .run()
    .await
    .expect("provisioning");
    let thing = IdentityStore::new(&config.identity.directory)
        .load()
        .expect("stored identity")
        .thing_name;
    assert_eq!(thing, identity.thing_name);

    let transport = Arc::new(LoopbackTransport::connected());
    let control = RecordingControl::new();
    let handle = FleetAgent::new(
        config,
        thing.clone(),
        transport.clone(),
        Arc::new(control.clone()),
        None,
    )
    .start()
    .await
    .expect("agent start");

    let jobs = JobTopics::new(&thing);
    wait_for_publish(&transport, &jobs.get(), 1).await;

    transport.inject_json(
        &topics::accepted(&jobs.get()),
        &json!({
            "inProgressJobs": [{"jobId": "J1", "versionNumber": 1, "executionNumber": 1}],
            "queuedJobs": []
        }),
    );
    wait_for_publish(&transport, &jobs.start_next(), 1).await;

    transport.inject_json(
        &topics::accepted(&jobs.start_next()),
        &execution_payload("J1", "sample", 2, 1),
    );
    wait_for("program start", || {
        control.calls_of(ControlAction::Start) == vec!["jobs_sample".to_owned()]
    })
    .await;

    transport.inject_json(
        &topics::process_state("jobs_sample"),
        &json!({
            "eventname": "PROCESS_STATE_FATAL",
            "processname": "jobs_sample",
            "groupname": "jobs_sample",
            "from_state": "BACKOFF"
        }),
    );
    let updates = wait_for_publish(&transport, &jobs.update("J1"), 1).await;
    let report = updates[0].json();
    assert_eq!(report["status"], "FAILED");
    assert_eq!(report["expectedVersion"], 2);
    assert_eq!(report["executionNumber"], 1);

    handle.shutdown().await.expect("shutdown");
    assert!(transport.is_closed());
}

#[tokio::test]
async fn replacement_job_stops_running_program_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(LoopbackTransport::connected());
    let control = RecordingControl::new();
    let handle = FleetAgent::new(
        agent_config(dir.path()),
        "thing-7",
        transport.clone(),
        Arc::new(control.clone()),
        None,
    )
    .start()
    .await
    .expect("agent start");

    let jobs = JobTopics::new("thing-7");
    wait_for_publish(&transport, &jobs.get(), 1).await;
    transport.inject_json(
        &topics::accepted(&jobs.start_next()),
        &execution_payload("J1", "alpha", 1, 1),
    );
    wait_for("first start", || !control.calls_of(ControlAction::Start).is_empty()).await;

    transport.inject_json(
        &topics::accepted(&jobs.start_next()),
        &execution_payload("J2", "beta", 1, 1),
    );
    wait_for("second start", || control.calls_of(ControlAction::Start).len() == 2).await;

    let calls: Vec<String> = control
        .calls()
        .into_iter()
        .map(|call| format!("{} {}", call.action, call.program))
        .collect();
    assert_eq!(
        calls,
        vec!["start jobs_alpha", "stop jobs_alpha", "start jobs_beta"]
    );

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shadow_converges_and_caches_desired_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = agent_config(dir.path());
    config.jobs.enabled = false;
    config.shadows.names = vec!["sample".into()];
    let cache_dir = config.shadows.cache_dir.clone();

    let transport = Arc::new(LoopbackTransport::connected());
    let handle = FleetAgent::new(
        config,
        "thing-2",
        transport.clone(),
        Arc::new(RecordingControl::new()),
        None,
    )
    .start()
    .await
    .expect("agent start");

    let shadow = ShadowTopics::new("thing-2", "sample");
    wait_for_publish(&transport, &shadow.get(), 1).await;

    transport.inject_json(
        &topics::accepted(&shadow.get()),
        &json!({
            "state": {
                "desired": {"interval": 30, "mode": "eco"},
                "reported": {"interval": 10, "legacy": true}
            },
            "version": 4
        }),
    );
    let updates = wait_for_publish(&transport, &shadow.update(), 1).await;
    assert_eq!(
        updates[0].json(),
        json!({"state": {"reported": {"interval": 30, "mode": "eco", "legacy": null}}})
    );
    let cached = ShadowCache::new(&cache_dir)
        .read("sample")
        .expect("cache read")
        .expect("cached");
    assert_eq!(cached["mode"], "eco");

    // already converged: no further update
    transport.inject_json(
        &format!("{}/documents", shadow.update()),
        &json!({
            "previous": {"state": {"desired": {"interval": 30, "mode": "eco"}}, "version": 4},
            "current": {
                "state": {
                    "desired": {"interval": 30, "mode": "eco"},
                    "reported": {"interval": 30, "mode": "eco"}
                },
                "version": 5
            }
        }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.published_to(&shadow.update()).len(), 1);

    handle.shutdown().await.expect("shutdown");
}
