//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Reconciler contract and the event loop that drives it."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Every reconciler is an actor: one task owns its state and receives inbound
//! messages, connection changes, heartbeats and its own deadline strictly one
//! at a time. Handlers publish with plain fire-and-forget requests and never
//! issue correlated calls, so they cannot stall the loop waiting on responses
//! that only the loop itself would deliver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r_fleet_msg::{ConnectionState, InboundMessage, MqttTransport};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Delay before a failed startup (subscribe/initial request) is retried.
pub const STARTUP_RETRY: Duration = Duration::from_secs(30);

/// Event-driven reconciliation unit.
#[async_trait]
pub trait Reconciler: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Subscribe and request the initial snapshot; runs after every (re)connect.
    async fn on_connected(&mut self) -> r_fleet_msg::Result<()>;

    /// Handle one inbound message; messages for other reconcilers are ignored.
    async fn on_message(&mut self, message: &InboundMessage);

    /// Drift-correction interval, `None` for purely event-driven units.
    fn heartbeat(&self) -> Option<Duration> {
        None
    }

    /// Periodic re-request of authoritative state.
    async fn on_heartbeat(&mut self) {}

    /// Next point in time [`Reconciler::on_deadline`] must run at.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    /// The deadline returned by [`Reconciler::deadline`] elapsed.
    async fn on_deadline(&mut self) {}

    /// Cancel timers and release local resources.
    async fn on_shutdown(&mut self) {}
}

/// Run `reconciler` until `shutdown` fires, returning it for inspection.
pub async fn drive<R: Reconciler>(
    mut reconciler: R,
    transport: Arc<dyn MqttTransport>,
    mut shutdown: broadcast::Receiver<()>,
) -> R {
    let mut inbound = transport.messages();
    let mut connection = transport.connection();
    let mut heartbeat = reconciler.heartbeat().map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut ready = false;
    let mut retry_at: Option<Instant> = None;

    if connection.borrow_and_update().is_connected() {
        ready = startup(&mut reconciler, &mut retry_at).await;
    }

    loop {
        let deadline = reconciler.deadline();
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(reconciler = reconciler.name(), "shutdown signal received");
                break;
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    warn!(reconciler = reconciler.name(), "transport dropped its connection channel");
                    break;
                }
                let state = *connection.borrow_and_update();
                match state {
                    ConnectionState::Connected { session } => {
                        info!(reconciler = reconciler.name(), session, "connected; re-running startup");
                        ready = startup(&mut reconciler, &mut retry_at).await;
                    }
                    ConnectionState::Disconnected => {
                        debug!(reconciler = reconciler.name(), "connection lost");
                        ready = false;
                        retry_at = None;
                    }
                }
            }
            received = inbound.recv() => match received {
                Ok(message) => reconciler.on_message(&message).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(reconciler = reconciler.name(), skipped, "inbound messages dropped; re-requesting state");
                    if ready {
                        reconciler.on_heartbeat().await;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tick(&mut heartbeat) => {
                if ready {
                    reconciler.on_heartbeat().await;
                }
            }
            _ = at(retry_at) => {
                retry_at = None;
                if connection.borrow().is_connected() {
                    ready = startup(&mut reconciler, &mut retry_at).await;
                }
            }
            _ = at(deadline) => reconciler.on_deadline().await,
        }
    }

    reconciler.on_shutdown().await;
    reconciler
}

async fn startup<R: Reconciler>(reconciler: &mut R, retry_at: &mut Option<Instant>) -> bool {
    match reconciler.on_connected().await {
        Ok(()) => {
            *retry_at = None;
            true
        }
        Err(err) => {
            warn!(
                reconciler = reconciler.name(),
                error = %err,
                retry_in = ?STARTUP_RETRY,
                "startup failed"
            );
            *retry_at = Some(Instant::now() + STARTUP_RETRY);
            false
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
