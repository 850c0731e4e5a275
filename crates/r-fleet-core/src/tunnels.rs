//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Secure tunnel notifications handed to the local proxy program."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r_fleet_logging::{fleet_debug, fleet_error, fleet_info, LogContext};
use r_fleet_msg::{subscribe_and_wait, topics, DeliveryGuarantee, InboundMessage, MqttTransport};
use r_fleet_supervision::ProcessControl;
use serde::Deserialize;

use crate::reconciler::Reconciler;

/// Service name of the SSH destination.
pub const SSH_SERVICE: &str = "SSH";

const SSH_CONFIG_FILE: &str = "ssh.ini";
const SSH_DESTINATION: &str = "localhost:22";

/// Payload of a tunnel notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelNotification {
    pub client_access_token: String,
    #[serde(default)]
    pub client_mode: Option<String>,
    pub region: String,
    #[serde(default)]
    pub services: Vec<String>,
}

/// Writes the local proxy configuration for SSH tunnels and starts the proxy.
pub struct TunnelHandler {
    thing: String,
    topic: String,
    transport: Arc<dyn MqttTransport>,
    control: Arc<dyn ProcessControl>,
    config_dir: PathBuf,
    program: String,
    ack_timeout: Duration,
}

impl TunnelHandler {
    pub fn new(
        thing: impl Into<String>,
        transport: Arc<dyn MqttTransport>,
        control: Arc<dyn ProcessControl>,
        config_dir: impl Into<PathBuf>,
        program: impl Into<String>,
    ) -> Self {
        let thing = thing.into();
        Self {
            topic: topics::tunnels_notify(&thing),
            thing,
            transport,
            control,
            config_dir: config_dir.into(),
            program: program.into(),
            ack_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Location of the proxy configuration for SSH tunnels.
    pub fn ssh_config_path(&self) -> PathBuf {
        self.config_dir.join(SSH_CONFIG_FILE)
    }

    async fn open(&self, notification: &TunnelNotification) {
        let context = LogContext::new()
            .with_thing(&self.thing)
            .with_program(&self.program);
        let path = self.ssh_config_path();
        if let Err(err) = write_ssh_config(&path, notification) {
            fleet_error!(
                context = context,
                "tunnel configuration {} not written: {}",
                path.display(),
                err
            );
            return;
        }
        match self.control.start(&self.program).await {
            Ok(()) => fleet_info!(
                context = context,
                "ssh tunnel proxy started (region {})",
                notification.region
            ),
            Err(err) => fleet_error!(context = context, "ssh tunnel proxy not started: {}", err),
        }
    }
}

fn write_ssh_config(path: &Path, notification: &TunnelNotification) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = format!(
        "region = {}\naccess-token = {}\ndestination-app = {}\n",
        notification.region, notification.client_access_token, SSH_DESTINATION
    );
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[async_trait]
impl Reconciler for TunnelHandler {
    fn name(&self) -> &str {
        "tunnels"
    }

    async fn on_connected(&mut self) -> r_fleet_msg::Result<()> {
        subscribe_and_wait(
            self.transport.as_ref(),
            &self.topic,
            DeliveryGuarantee::AtLeastOnce,
            self.ack_timeout,
        )
        .await
    }

    async fn on_message(&mut self, message: &InboundMessage) {
        if message.topic != self.topic {
            return;
        }
        let notification: TunnelNotification = match message.json() {
            Ok(notification) => notification,
            Err(err) => {
                fleet_error!(
                    context = LogContext::new().with_thing(&self.thing),
                    "malformed tunnel notification: {}",
                    err
                );
                return;
            }
        };
        if notification
            .services
            .iter()
            .any(|service| service == SSH_SERVICE)
        {
            self.open(&notification).await;
        } else {
            fleet_debug!(
                context = LogContext::new().with_thing(&self.thing),
                "tunnel notification without ssh ignored: {:?}",
                notification.services
            );
        }
    }
}
