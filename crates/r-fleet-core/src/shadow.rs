//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Diff-based named shadow synchronisation."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r_fleet_logging::{fleet_debug, fleet_error, fleet_info, fleet_warn, LogContext};
use r_fleet_metrics::AgentMetrics;
use r_fleet_msg::topics::{ShadowTopic, ShadowTopics};
use r_fleet_msg::types::{RejectedResponse, ShadowDocument, ShadowDocuments, ShadowState};
use r_fleet_msg::{
    subscribe_all, DeliveryGuarantee, InboundMessage, MqttTransport, MqttTransportExt,
};
use r_fleet_persistence::ShadowCache;
use serde_json::{json, Map, Value};

use crate::reconciler::Reconciler;

/// Shadow service code for "no such shadow".
const NOT_FOUND: &str = "404";

/// One-level difference between a reported and a desired map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowDiff {
    /// Desired keys missing from reported.
    pub added: Map<String, Value>,
    /// Reported keys no longer desired.
    pub removed: Map<String, Value>,
    /// Keys present in both with different values.
    pub changed: Map<String, Value>,
}

impl ShadowDiff {
    /// Whether reported already matches desired.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// `reported` section that makes reported equal to `desired`.
    ///
    /// Removed keys are sent as `null`; the shadow service only deletes an
    /// attribute when it is explicitly nulled.
    pub fn reported_patch(&self, desired: &Map<String, Value>) -> Map<String, Value> {
        let mut patch = desired.clone();
        for key in self.removed.keys() {
            patch.insert(key.clone(), Value::Null);
        }
        patch
    }
}

/// Compare `reported` against `desired` by top-level key and value equality.
pub fn diff(reported: &Map<String, Value>, desired: &Map<String, Value>) -> ShadowDiff {
    let mut result = ShadowDiff::default();
    for (key, value) in desired {
        match reported.get(key) {
            None => {
                result.added.insert(key.clone(), value.clone());
            }
            Some(current) if current != value => {
                result.changed.insert(key.clone(), value.clone());
            }
            Some(_) => {}
        }
    }
    for (key, value) in reported {
        if !desired.contains_key(key) {
            result.removed.insert(key.clone(), value.clone());
        }
    }
    result
}

/// Keeps the reported section of one named shadow equal to its desired section.
pub struct ShadowReconciler {
    name: String,
    thing: String,
    topics: ShadowTopics,
    transport: Arc<dyn MqttTransport>,
    cache: ShadowCache,
    heartbeat: Duration,
    ack_timeout: Duration,
    metrics: Option<AgentMetrics>,
}

impl ShadowReconciler {
    pub fn new(
        thing: impl Into<String>,
        name: impl Into<String>,
        transport: Arc<dyn MqttTransport>,
        cache: ShadowCache,
    ) -> Self {
        let thing = thing.into();
        let name = name.into();
        Self {
            topics: ShadowTopics::new(&thing, &name),
            name,
            thing,
            transport,
            cache,
            heartbeat: Duration::from_secs(600),
            ack_timeout: Duration::from_secs(15),
            metrics: None,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shadow name.
    pub fn shadow(&self) -> &str {
        &self.name
    }

    fn context(&self) -> LogContext<'_> {
        LogContext::new()
            .with_thing(&self.thing)
            .with_shadow(&self.name)
    }

    async fn request_document(&self) {
        if let Err(err) = self
            .transport
            .publish_empty(&self.topics.get(), DeliveryGuarantee::AtLeastOnce)
            .await
        {
            fleet_warn!(context = self.context(), "shadow get not sent: {}", err);
        }
    }

    /// Cache `desired` and publish the corrective update when reported differs.
    ///
    /// Returns whether an update was published.
    pub async fn reconcile(&self, state: &ShadowState) -> bool {
        let difference = diff(&state.reported, &state.desired);
        if let Err(err) = self.cache.write(&self.name, &state.desired) {
            fleet_error!(context = self.context(), "shadow cache not written: {}", err);
        }
        if difference.is_empty() {
            fleet_debug!(context = self.context(), "reported state in sync");
            return false;
        }

        fleet_info!(
            context = self.context(),
            "reporting shadow state (added {}, removed {}, changed {})",
            difference.added.len(),
            difference.removed.len(),
            difference.changed.len()
        );
        let body = json!({
            "state": { "reported": difference.reported_patch(&state.desired) }
        });
        match self
            .transport
            .publish_json(&self.topics.update(), DeliveryGuarantee::AtLeastOnce, &body)
            .await
        {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_shadow_update(&self.name);
                }
                true
            }
            Err(err) => {
                fleet_warn!(context = self.context(), "shadow update not sent: {}", err);
                false
            }
        }
    }

    fn drop_cache(&self) {
        match self.cache.delete(&self.name) {
            Ok(true) => fleet_info!(context = self.context(), "shadow cache removed"),
            Ok(false) => {}
            Err(err) => fleet_error!(context = self.context(), "shadow cache not removed: {}", err),
        }
    }

    fn rejected(&self, message: &InboundMessage) {
        let body: RejectedResponse = message.json().unwrap_or_default();
        fleet_error!(
            context = self.context(),
            "request rejected on {}: {} {}",
            message.topic,
            body.code_text(),
            body.message.as_deref().unwrap_or("")
        );
    }
}

#[async_trait]
impl Reconciler for ShadowReconciler {
    fn name(&self) -> &str {
        "shadow"
    }

    async fn on_connected(&mut self) -> r_fleet_msg::Result<()> {
        subscribe_all(
            self.transport.as_ref(),
            &self.topics.subscriptions(),
            DeliveryGuarantee::AtLeastOnce,
            self.ack_timeout,
        )
        .await?;
        self.transport
            .publish_empty(&self.topics.get(), DeliveryGuarantee::AtLeastOnce)
            .await
    }

    async fn on_message(&mut self, message: &InboundMessage) {
        let Some(kind) = self.topics.classify(&message.topic) else {
            return;
        };
        match kind {
            ShadowTopic::GetAccepted => match message.json::<ShadowDocument>() {
                Ok(document) => {
                    self.reconcile(&document.state).await;
                }
                Err(err) => fleet_warn!(context = self.context(), "malformed shadow document: {}", err),
            },
            ShadowTopic::UpdateDocuments => match message.json::<ShadowDocuments>() {
                Ok(documents) => {
                    self.reconcile(&documents.current.state).await;
                }
                Err(err) => fleet_warn!(context = self.context(), "malformed shadow documents: {}", err),
            },
            ShadowTopic::GetRejected => {
                let body: RejectedResponse = message.json().unwrap_or_default();
                if body.code_text() == NOT_FOUND {
                    // no shadow yet, or deleted upstream
                    self.drop_cache();
                } else {
                    self.rejected(message);
                }
            }
            ShadowTopic::UpdateDelta | ShadowTopic::UpdateAccepted => self.request_document().await,
            ShadowTopic::DeleteAccepted => self.drop_cache(),
            ShadowTopic::UpdateRejected | ShadowTopic::DeleteRejected => self.rejected(message),
        }
    }

    fn heartbeat(&self) -> Option<Duration> {
        Some(self.heartbeat)
    }

    async fn on_heartbeat(&mut self) {
        self.request_document().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_fleet_msg::LoopbackTransport;

    const GET: &str = "$aws/things/thing-1/shadow/name/sample/get";
    const UPDATE: &str = "$aws/things/thing-1/shadow/name/sample/update";

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn state(desired: Value, reported: Value) -> ShadowState {
        ShadowState {
            desired: map(desired),
            reported: map(reported),
        }
    }

    fn reconciler(transport: &Arc<LoopbackTransport>, dir: &tempfile::TempDir) -> ShadowReconciler {
        ShadowReconciler::new(
            "thing-1",
            "sample",
            transport.clone(),
            ShadowCache::new(dir.path()),
        )
    }

    #[test]
    fn diff_classifies_keys() {
        let result = diff(
            &map(json!({"a": 1, "b": 2, "c": {"x": 1}})),
            &map(json!({"b": 3, "c": {"x": 1}, "d": 4})),
        );
        assert_eq!(result.added, map(json!({"d": 4})));
        assert_eq!(result.removed, map(json!({"a": 1})));
        assert_eq!(result.changed, map(json!({"b": 3})));
        assert_eq!(
            Value::Object(result.reported_patch(&map(json!({"b": 3, "c": {"x": 1}, "d": 4})))),
            json!({"a": null, "b": 3, "c": {"x": 1}, "d": 4})
        );
    }

    #[test]
    fn nested_maps_compare_by_value() {
        let result = diff(&map(json!({"c": {"x": 1}})), &map(json!({"c": {"x": 2}})));
        assert_eq!(result.changed, map(json!({"c": {"x": 2}})));
    }

    #[tokio::test]
    async fn empty_document_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::connected());
        let shadow = reconciler(&transport, &dir);

        assert!(!shadow.reconcile(&state(json!({}), json!({}))).await);
        assert!(transport.published().is_empty());
        assert_eq!(
            ShadowCache::new(dir.path()).read("sample").unwrap(),
            Some(Map::new())
        );
    }

    #[tokio::test]
    async fn added_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::connected());
        let shadow = reconciler(&transport, &dir);

        assert!(shadow.reconcile(&state(json!({"a": 1}), json!({}))).await);
        let published = transport.published_to(UPDATE);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].json(), json!({"state": {"reported": {"a": 1}}}));
    }

    #[tokio::test]
    async fn removed_key_is_nulled() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::connected());
        let shadow = reconciler(&transport, &dir);

        shadow.reconcile(&state(json!({}), json!({"a": 1}))).await;
        let published = transport.published_to(UPDATE);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].json(), json!({"state": {"reported": {"a": null}}}));
    }

    #[tokio::test]
    async fn startup_subscribes_then_requests_document() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::connected());
        let mut shadow = reconciler(&transport, &dir);

        shadow.on_connected().await.unwrap();

        assert_eq!(transport.active_subscriptions().len(), 8);
        assert_eq!(transport.published_to(GET).len(), 1);
    }

    #[tokio::test]
    async fn not_found_drops_cache_and_other_rejections_keep_it() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::connected());
        let mut shadow = reconciler(&transport, &dir);
        let cache = ShadowCache::new(dir.path());
        cache.write("sample", &map(json!({"a": 1}))).unwrap();

        shadow
            .on_message(&InboundMessage::new(
                format!("{GET}/rejected"),
                json!({"code": 500, "message": "boom"}).to_string(),
            ))
            .await;
        assert!(cache.read("sample").unwrap().is_some());

        shadow
            .on_message(&InboundMessage::new(
                format!("{GET}/rejected"),
                json!({"code": 404, "message": "No shadow exists with name: 'sample'"}).to_string(),
            ))
            .await;
        assert!(cache.read("sample").unwrap().is_none());
    }

    #[tokio::test]
    async fn documents_and_deltas_drive_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::connected());
        let mut shadow = reconciler(&transport, &dir);

        shadow
            .on_message(&InboundMessage::new(
                format!("{UPDATE}/documents"),
                json!({
                    "previous": {"state": {"desired": {}}, "version": 1},
                    "current": {"state": {"desired": {"led": "on"}, "reported": null}, "version": 2}
                })
                .to_string(),
            ))
            .await;
        assert_eq!(
            transport.published_to(UPDATE)[0].json(),
            json!({"state": {"reported": {"led": "on"}}})
        );

        shadow
            .on_message(&InboundMessage::new(format!("{UPDATE}/delta"), "{}"))
            .await;
        shadow
            .on_message(&InboundMessage::new(format!("{UPDATE}/accepted"), "{}"))
            .await;
        assert_eq!(transport.published_to(GET).len(), 2);
    }

    #[tokio::test]
    async fn other_shadows_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::connected());
        let mut shadow = reconciler(&transport, &dir);

        shadow
            .on_message(&InboundMessage::new(
                "$aws/things/thing-1/shadow/name/other/get/accepted",
                json!({"state": {"desired": {"a": 1}}}).to_string(),
            ))
            .await;
        assert!(transport.published().is_empty());
    }
}
