//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Prometheus instrumentation of broker traffic."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// Prometheus metric handles for messaging activity.
#[derive(Clone)]
pub struct MessagingMetrics {
    sent: IntCounter,
    received: IntCounter,
    dropped: IntCounter,
    correlated: IntCounterVec,
    latency: Histogram,
}

impl MessagingMetrics {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounter::with_opts(Opts::new(
            "fleet_messages_sent_total",
            "Messages handed to the broker client",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "fleet_messages_received_total",
            "Messages delivered by the broker",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "fleet_messages_dropped_total",
            "Publishes the broker client refused",
        ))?;
        let correlated = IntCounterVec::new(
            Opts::new(
                "fleet_correlated_calls_total",
                "Correlated request/response calls by outcome",
            ),
            &["outcome"],
        )?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "fleet_correlated_call_seconds",
            "Time between publishing a correlated request and its response",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(correlated.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
            correlated,
            latency,
        })
    }

    /// Record a sent message.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record a received message.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record a refused publish.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record the outcome of a correlated call (`accepted`, `rejected`, `timeout`, `error`).
    pub fn observe_call(&self, outcome: &str, elapsed: Option<Duration>) {
        self.correlated.with_label_values(&[outcome]).inc();
        if let Some(elapsed) = elapsed {
            self.latency.observe(elapsed.as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_record_counts() {
        let registry = Registry::new();
        let metrics = MessagingMetrics::register(&registry).unwrap();
        metrics.observe_sent();
        metrics.observe_received();
        metrics.observe_dropped();
        metrics.observe_call("accepted", Some(Duration::from_millis(10)));
        metrics.observe_call("timeout", None);

        let families = registry.gather();
        let calls = families
            .iter()
            .find(|f| f.get_name() == "fleet_correlated_calls_total")
            .unwrap();
        assert_eq!(calls.get_metric().len(), 2);
        assert!(families
            .iter()
            .any(|f| f.get_name() == "fleet_messages_sent_total"));
    }
}
