//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Agent orchestration and lifecycle management."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{anyhow, Result};
use r_fleet_common::config::AppConfig;
use r_fleet_logging::{log_system_event, LogContext, SystemEventOutcome};
use r_fleet_metrics::{AgentMetrics, SharedRegistry};
use r_fleet_msg::MqttTransport;
use r_fleet_persistence::{JobDescriptorStore, ShadowCache};
use r_fleet_supervision::ProcessControl;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::jobs::{JobReconciler, JobSettings};
use crate::presence::PresenceAnnouncer;
use crate::reconciler::{drive, Reconciler};
use crate::shadow::ShadowReconciler;
use crate::tunnels::TunnelHandler;

/// Wires the configured reconcilers to one broker session.
pub struct FleetAgent {
    config: Arc<AppConfig>,
    thing: String,
    transport: Arc<dyn MqttTransport>,
    control: Arc<dyn ProcessControl>,
    metrics_registry: Option<SharedRegistry>,
}

impl FleetAgent {
    pub fn new(
        config: AppConfig,
        thing: impl Into<String>,
        transport: Arc<dyn MqttTransport>,
        control: Arc<dyn ProcessControl>,
        metrics: Option<SharedRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            thing: thing.into(),
            transport,
            control,
            metrics_registry: metrics,
        }
    }

    /// Spawn every enabled reconciler and return a handle for lifecycle control.
    pub async fn start(self) -> Result<AgentHandle> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let metrics = match &self.metrics_registry {
            Some(registry) => Some(AgentMetrics::new(registry.clone())?),
            None => None,
        };
        let config = &self.config;
        let ack_timeout = config.broker.ack_timeout;
        let mut tasks = Vec::new();

        if config.jobs.enabled {
            let mut jobs = JobReconciler::new(
                self.thing.clone(),
                self.transport.clone(),
                self.control.clone(),
                JobDescriptorStore::new(&config.jobs.descriptor_dir),
                JobSettings::from_config(&config.jobs, ack_timeout),
            );
            if let Some(metrics) = &metrics {
                jobs = jobs.with_metrics(metrics.clone());
            }
            tasks.push(spawn(jobs, &self.transport, &shutdown_rx));
        }

        for name in &config.shadows.names {
            let mut shadow = ShadowReconciler::new(
                self.thing.clone(),
                name.clone(),
                self.transport.clone(),
                ShadowCache::new(&config.shadows.cache_dir),
            )
            .with_heartbeat(config.shadows.heartbeat)
            .with_ack_timeout(ack_timeout);
            if let Some(metrics) = &metrics {
                shadow = shadow.with_metrics(metrics.clone());
            }
            tasks.push(spawn(shadow, &self.transport, &shutdown_rx));
        }

        if config.tunnels.enabled {
            let tunnels = TunnelHandler::new(
                self.thing.clone(),
                self.transport.clone(),
                self.control.clone(),
                &config.tunnels.config_dir,
                config.tunnels.program.clone(),
            )
            .with_ack_timeout(ack_timeout);
            tasks.push(spawn(tunnels, &self.transport, &shutdown_rx));
        }

        if config.presence.enabled {
            let presence = PresenceAnnouncer::new(
                self.thing.clone(),
                &config.presence.shadow,
                self.transport.clone(),
            )
            .with_ack_timeout(ack_timeout);
            tasks.push(spawn(presence, &self.transport, &shutdown_rx));
        }

        if let Some(metrics) = metrics.clone() {
            tasks.push(ReconcilerTask {
                name: "connection".to_owned(),
                task: track_connection(
                    self.thing.clone(),
                    self.transport.clone(),
                    metrics,
                    shutdown_rx.resubscribe(),
                ),
            });
        }

        log_system_event(
            Some(&LogContext::new().with_thing(&self.thing)),
            "agent_start",
            &format!("{} reconcilers running on {}", tasks.len(), self.transport.name()),
            SystemEventOutcome::Success,
        );
        info!(thing = %self.thing, app = %config.app_name, "agent started");

        Ok(AgentHandle {
            thing: self.thing,
            shutdown: shutdown_tx,
            tasks,
            transport: self.transport,
            config: self.config,
            metrics,
        })
    }
}

fn spawn<R>(
    reconciler: R,
    transport: &Arc<dyn MqttTransport>,
    shutdown: &broadcast::Receiver<()>,
) -> ReconcilerTask
where
    R: Reconciler + 'static,
{
    let name = reconciler.name().to_owned();
    let transport = transport.clone();
    let shutdown = shutdown.resubscribe();
    let task = tokio::spawn(async move {
        let reconciler = drive(reconciler, transport, shutdown).await;
        debug!(reconciler = reconciler.name(), "reconciler stopped");
    });
    ReconcilerTask { name, task }
}

fn track_connection(
    thing: String,
    transport: Arc<dyn MqttTransport>,
    metrics: AgentMetrics,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connection = transport.connection();
        loop {
            let connected = connection.borrow_and_update().is_connected();
            metrics.set_connected(&thing, connected);
            tokio::select! {
                _ = shutdown.recv() => break,
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        metrics.set_connected(&thing, false);
    })
}

struct ReconcilerTask {
    name: String,
    task: JoinHandle<()>,
}

/// Running agent.
pub struct AgentHandle {
    thing: String,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<ReconcilerTask>,
    transport: Arc<dyn MqttTransport>,
    config: Arc<AppConfig>,
    metrics: Option<AgentMetrics>,
}

impl AgentHandle {
    pub fn thing(&self) -> &str {
        &self.thing
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<AgentMetrics> {
        self.metrics.clone()
    }

    /// Names of the running reconcilers, in start order.
    pub fn reconcilers(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.name.as_str()).collect()
    }

    /// Stop every reconciler (timers first), then disconnect best-effort.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        let mut failed = Vec::new();
        for ReconcilerTask { name, task } in self.tasks {
            if let Err(err) = task.await {
                warn!(reconciler = %name, error = %err, "reconciler task ended abnormally");
                failed.push(name);
            }
        }
        if let Err(err) = self.transport.disconnect().await {
            debug!(error = %err, "disconnect during shutdown failed");
        }
        let context = LogContext::new().with_thing(&self.thing);
        if failed.is_empty() {
            log_system_event(
                Some(&context),
                "agent_stop",
                "agent shutdown complete",
                SystemEventOutcome::Success,
            );
            Ok(())
        } else {
            log_system_event(
                Some(&context),
                "agent_stop",
                &format!("reconcilers failed: {}", failed.join(", ")),
                SystemEventOutcome::Fault,
            );
            Err(anyhow!("reconcilers ended abnormally: {}", failed.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_fleet_msg::LoopbackTransport;
    use r_fleet_supervision::RecordingControl;
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.jobs.descriptor_dir = dir.path().join("jobs");
        config.shadows.cache_dir = dir.path().join("shadows");
        config.shadows.names = vec!["sample".into(), "config".into()];
        config.tunnels.config_dir = dir.path().join("localproxy");
        config.tunnels.enabled = true;
        config.presence.enabled = true;
        config
    }

    #[tokio::test]
    async fn starts_enabled_reconcilers_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::connected());
        let registry = r_fleet_metrics::new_registry();
        let agent = FleetAgent::new(
            config(&dir),
            "thing-1",
            transport.clone(),
            Arc::new(RecordingControl::new()),
            Some(registry.clone()),
        );

        let handle = agent.start().await.unwrap();
        assert_eq!(
            handle.reconcilers(),
            vec!["jobs", "shadow", "shadow", "tunnels", "presence", "connection"]
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while transport
            .published_to("$aws/things/thing-1/jobs/get")
            .is_empty()
        {
            assert!(tokio::time::Instant::now() < deadline, "jobs never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await.unwrap();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn disabled_features_are_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.jobs.enabled = false;
        config.tunnels.enabled = false;
        config.presence.enabled = false;
        config.shadows.names.clear();
        let agent = FleetAgent::new(
            config,
            "thing-1",
            Arc::new(LoopbackTransport::connected()),
            Arc::new(RecordingControl::new()),
            None,
        );

        let handle = agent.start().await.unwrap();
        assert!(handle.reconcilers().is_empty());
        handle.shutdown().await.unwrap();
    }
}
