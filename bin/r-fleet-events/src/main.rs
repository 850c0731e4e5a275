//! ---
//! fleet_section: "07-resilience-fault-tolerance"
//! fleet_subsection: "binary"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Binary entrypoint for the supervisord event-listener bridge."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use r_fleet_common::config::AppConfig;
use r_fleet_msg::{connect_and_wait, MqttTransport, RumqttSettings, RumqttTransport, TlsCredentials};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod bridge;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Republish supervisord process events to the broker",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "MQTT client id (defaults to <app_name>-supervisor-events)")]
    client_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // stdout carries the listener protocol; supervisord captures stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_env("R_FLEET_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.extend(AppConfig::default_candidates());
    let config = AppConfig::load(&candidates)?;

    let client_id = cli
        .client_id
        .unwrap_or_else(|| format!("{}-supervisor-events", config.app_name));
    let mut settings = RumqttSettings::new(&client_id, &config.broker.host, config.broker.port);
    settings.keep_alive = config.broker.keep_alive;
    settings.capacity = config.broker.channel_capacity;
    if let Some(tls) = &config.broker.tls {
        settings = settings.with_tls(
            TlsCredentials::from_files(&tls.root_ca, &tls.certificate, &tls.private_key)
                .context("failed to read broker TLS material")?,
        );
    }
    let transport = RumqttTransport::spawn(settings, None);
    connect_and_wait(&transport, config.broker.connect_timeout)
        .await
        .context("broker unreachable")?;
    info!(client = %client_id, "event bridge connected");

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let handled = bridge::serve(&mut stdin, &mut stdout, &transport).await?;
    info!(handled, "supervisor closed the event stream");

    let _ = transport.disconnect().await;
    Ok(())
}
