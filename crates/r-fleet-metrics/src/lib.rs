//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Metrics collection and export utilities."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the agent.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address the exporter is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "r_fleetd_starts_total",
            "Total number of times the R-Fleet agent has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_fleetd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "r_fleetd_build_info",
                "Build metadata for the running agent binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Reconciliation activity of the agent.
#[derive(Clone, Debug)]
pub struct AgentMetrics {
    registry: SharedRegistry,
    job_transitions: IntCounterVec,
    job_active: IntGauge,
    job_reports: IntCounterVec,
    shadow_updates: IntCounterVec,
    connected: IntGaugeVec,
}

impl AgentMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let job_transitions = IntCounterVec::new(
            Opts::new(
                "r_fleet_job_transitions_total",
                "Supervised program transitions driven by the job reconciler",
            ),
            &["program", "action"],
        )?;
        registry.register(Box::new(job_transitions.clone()))?;

        let job_active = IntGauge::with_opts(Opts::new(
            "r_fleet_job_active",
            "Indicator (0/1) whether a job execution is currently active",
        ))?;
        registry.register(Box::new(job_active.clone()))?;

        let job_reports = IntCounterVec::new(
            Opts::new(
                "r_fleet_job_status_reports_total",
                "Job execution status updates sent upstream by status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(job_reports.clone()))?;

        let shadow_updates = IntCounterVec::new(
            Opts::new(
                "r_fleet_shadow_updates_total",
                "Reported-state updates published by shadow name",
            ),
            &["shadow"],
        )?;
        registry.register(Box::new(shadow_updates.clone()))?;

        let connected = IntGaugeVec::new(
            Opts::new(
                "r_fleet_broker_connected",
                "Indicator (0/1) whether the broker session is up",
            ),
            &["client"],
        )?;
        registry.register(Box::new(connected.clone()))?;

        Ok(Self {
            registry,
            job_transitions,
            job_active,
            job_reports,
            shadow_updates,
            connected,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_job_transition(&self, program: &str, action: &str) {
        self.job_transitions
            .with_label_values(&[program, action])
            .inc();
    }

    pub fn set_job_active(&self, active: bool) {
        self.job_active.set(if active { 1 } else { 0 });
    }

    pub fn record_job_report(&self, status: &str) {
        self.job_reports.with_label_values(&[status]).inc();
    }

    pub fn record_shadow_update(&self, shadow: &str) {
        self.shadow_updates.with_label_values(&[shadow]).inc();
    }

    pub fn set_connected(&self, client: &str, connected: bool) {
        self.connected
            .with_label_values(&[client])
            .set(if connected { 1 } else { 0 });
    }
}

pub use prometheus;
