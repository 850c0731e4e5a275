//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "binary"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Binary entrypoint for the R-Fleet agent daemon."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use r_fleet_common::config::AppConfig;
use r_fleet_common::logging::{init_tracing, init_tracing_with};
use r_fleet_core::FleetAgent;
use r_fleet_metrics::{new_registry, spawn_http_server, DaemonMetrics, SharedRegistry};
use r_fleet_msg::{
    connect_and_wait, log_forwarder, topics, MessagingMetrics, MqttTransport, RumqttSettings,
    RumqttTransport, TlsCredentials,
};
use r_fleet_persistence::IdentityStore;
use r_fleet_security::{ProvisioningExchange, ProvisioningSettings, RumqttConnector};
use r_fleet_supervision::SupervisorCtl;
use tracing::{info, warn, Level};

const SERVICE: &str = "r-fleetd";

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("R-Fleet ", env!("CARGO_PKG_VERSION")),
    about = "R-Fleet device agent",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the agent until interrupted")]
    Run,
    #[command(about = "Obtain a device certificate and bind the thing")]
    Provision {
        #[arg(long, help = "Replace an existing identity")]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.extend(AppConfig::default_candidates());

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, loaded.source, metrics_registry).await,
        Commands::Provision { force } => {
            init_tracing(SERVICE, &config.logging)?;
            provision(&config, force).await
        }
    }
}

async fn run_daemon(
    config: AppConfig,
    config_path: PathBuf,
    metrics_registry: SharedRegistry,
) -> Result<()> {
    let forward_queue = if config.logging.forward {
        let level: Level = config
            .logging
            .forward_level
            .parse()
            .with_context(|| format!("invalid logging.forward_level '{}'", config.logging.forward_level))?;
        let (layer, queue) = log_forwarder(SERVICE, level, config.logging.forward_capacity);
        init_tracing_with(SERVICE, &config.logging, Some(layer))?;
        Some(queue)
    } else {
        init_tracing(SERVICE, &config.logging)?;
        None
    };
    info!(config = %config_path.display(), "configuration loaded");

    let thing = resolve_thing(&config)?;
    let messaging_metrics = MessagingMetrics::register(&metrics_registry)
        .context("failed to register messaging metrics")?;

    let mut settings = RumqttSettings::new(&thing, &config.broker.host, config.broker.port);
    settings.keep_alive = config.broker.keep_alive;
    settings.capacity = config.broker.channel_capacity;
    if let Some(tls) = &config.broker.tls {
        let credentials = TlsCredentials::from_files(&tls.root_ca, &tls.certificate, &tls.private_key)
            .context("failed to read broker TLS material")?;
        settings = settings.with_tls(credentials);
    }
    let transport: Arc<dyn MqttTransport> =
        Arc::new(RumqttTransport::spawn(settings, Some(messaging_metrics)));

    match connect_and_wait(transport.as_ref(), config.broker.connect_timeout).await {
        Ok(session) => info!(thing = %thing, session, "broker session established"),
        Err(err) => warn!(thing = %thing, error = %err, "broker not reachable yet; reconcilers start on connect"),
    }

    let forwarder = forward_queue
        .map(|queue| queue.spawn(transport.clone(), topics::log(&config.topic_prefix, &thing)));

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };
    let agent_registry = config.metrics.enabled.then(|| metrics_registry.clone());

    let control = Arc::new(SupervisorCtl::new(
        &config.supervisor.command,
        &config.supervisor.config_file,
    ));
    let agent = FleetAgent::new(config, thing, transport, control, agent_registry);
    let handle = agent.start().await?;

    info!(thing = %handle.thing(), "agent running; waiting for termination signal");
    shutdown_signal().await?;
    info!("termination signal received; shutting down");
    handle.shutdown().await?;

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

fn resolve_thing(config: &AppConfig) -> Result<String> {
    if let Some(thing) = config.thing_name_override() {
        return Ok(thing);
    }
    let store = IdentityStore::new(&config.identity.directory);
    let identity = store.load().with_context(|| {
        format!(
            "no provisioned identity in {}; run `{} provision` first",
            config.identity.directory.display(),
            SERVICE
        )
    })?;
    info!(
        thing = %identity.thing_name,
        certificate = %identity.certificate_id,
        "loaded provisioned identity"
    );
    Ok(identity.thing_name)
}

async fn provision(config: &AppConfig, force: bool) -> Result<()> {
    let store = IdentityStore::new(&config.identity.directory);
    if store.exists() && !force {
        bail!(
            "identity already present in {}; pass --force to replace it",
            config.identity.directory.display()
        );
    }

    let endpoint = config.provisioning.resolve_endpoint()?;
    let provisioning = &config.provisioning;
    let mut settings = ProvisioningSettings::from_files(
        &config.topic_prefix,
        provisioning
            .common_name
            .clone()
            .unwrap_or_else(|| config.app_name.clone()),
        &provisioning.root_ca,
        &provisioning.bootstrap_certificate,
        &provisioning.bootstrap_private_key,
    )
    .context("failed to read bootstrap credentials")?;
    settings.country = provisioning.country.clone();
    settings.connect_timeout = config.broker.connect_timeout;
    settings.response_timeout = provisioning.timeout;
    settings.ack_timeout = config.broker.ack_timeout;

    let connector = RumqttConnector::new(endpoint.clone(), provisioning.port)
        .with_session(config.broker.keep_alive, config.broker.channel_capacity);
    info!(endpoint = %endpoint, port = provisioning.port, "provisioning device");
    let identity = ProvisioningExchange::new(connector, settings, store)
        .run()
        .await
        .context("provisioning failed")?;

    println!(
        "Thing: {}\nCertificate: {}\nStored in: {}",
        identity.thing_name,
        identity.certificate_id,
        config.identity.directory.display()
    );
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}
