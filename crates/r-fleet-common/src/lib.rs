//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared primitives and utilities for the device agent."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Core shared primitives for the R-Fleet device agent workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the daemon, the event bridge and the operator CLI.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BrokerConfig, CorrelatorConfig, IdentityConfig, JobsConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, PresenceConfig, ProvisioningConfig, ShadowsConfig,
    SupervisorConfig, TlsFiles, TunnelsConfig,
};
pub use logging::{init_tracing, init_tracing_with, LogFormat};
