//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Reconcilers and agent orchestration."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Reconcilers, connection-scoped handlers and the agent orchestrator for R-Fleet.

pub mod agent;
pub mod jobs;
pub mod presence;
pub mod reconciler;
pub mod shadow;
pub mod tunnels;

pub use agent::{AgentHandle, FleetAgent};
pub use jobs::{execution_payload, JobReconciler, JobSettings, JobState};
pub use presence::PresenceAnnouncer;
pub use reconciler::{drive, Reconciler, STARTUP_RETRY};
pub use shadow::{diff, ShadowDiff, ShadowReconciler};
pub use tunnels::{TunnelHandler, TunnelNotification};
