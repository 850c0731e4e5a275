//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Correlated request/response over publish/subscribe."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Request/response on top of publish/subscribe.
//!
//! A call embeds a correlation token in its JSON payload, subscribes to the
//! `/accepted` and `/rejected` responses of the request topic, publishes and
//! waits for the response that echoes its token. Responses carrying another
//! token belong to a concurrent call and are left for it.
//!
//! Waiters are keyed by token in a table served by a single dispatch task.
//! Response subscriptions are shared between concurrent calls on the same
//! topic and released by the last one, whatever way the call ends.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::metrics::MessagingMetrics;
use crate::qos::DeliveryGuarantee;
use crate::topics;
use crate::transport::MqttTransport;
use crate::types::InboundMessage;
use crate::waiters::{subscribe_and_wait, unsubscribe_and_wait};
use crate::{MessagingError, Result};

/// Reserved payload field carrying the correlation token.
pub const CLIENT_TOKEN_FIELD: &str = "clientToken";

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Which response topic answered a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Response arrived on `{base}/accepted`.
    Accepted,
    /// Response arrived on `{base}/rejected`.
    Rejected,
}

/// Response matched to a correlated call.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedResponse {
    /// Accepted or rejected.
    pub outcome: ResponseOutcome,
    /// Concrete topic of the response.
    pub topic: String,
    /// Response body.
    pub payload: Value,
}

impl CorrelatedResponse {
    /// Body of an accepted response; a rejection becomes [`MessagingError::Rejected`].
    pub fn into_accepted(self) -> Result<Value> {
        match self.outcome {
            ResponseOutcome::Accepted => Ok(self.payload),
            ResponseOutcome::Rejected => Err(MessagingError::Rejected {
                topic: self.topic,
                payload: self.payload,
            }),
        }
    }
}

struct Waiter {
    base: String,
    tx: oneshot::Sender<CorrelatedResponse>,
}

struct Shared {
    waiters: Mutex<HashMap<String, Waiter>>,
    subscriptions: tokio::sync::Mutex<HashMap<String, usize>>,
}

/// Correlates requests with their responses on one transport.
pub struct Correlator {
    transport: Arc<dyn MqttTransport>,
    shared: Arc<Shared>,
    qos: DeliveryGuarantee,
    ack_timeout: Duration,
    metrics: Option<MessagingMetrics>,
    dispatcher: JoinHandle<()>,
}

impl Correlator {
    /// Create a correlator and start its dispatch task.
    pub fn new(transport: Arc<dyn MqttTransport>) -> Self {
        let shared = Arc::new(Shared {
            waiters: Mutex::new(HashMap::new()),
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
        });
        let dispatcher = tokio::spawn(dispatch(transport.messages(), Arc::downgrade(&shared)));
        Self {
            transport,
            shared,
            qos: DeliveryGuarantee::AtLeastOnce,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            metrics: None,
            dispatcher,
        }
    }

    /// Delivery guarantee used for the request and its response subscriptions.
    pub fn with_qos(mut self, qos: DeliveryGuarantee) -> Self {
        self.qos = qos;
        self
    }

    /// Budget for each subscribe/unsubscribe acknowledgement.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Record call outcomes.
    pub fn with_metrics(mut self, metrics: MessagingMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of calls currently waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.waiters.lock().len()
    }

    /// Publish `payload` on `topic` and wait up to `timeout` for its response.
    ///
    /// A `clientToken` is generated when the payload does not carry one. The
    /// response subscriptions are in place before the request is published.
    pub async fn call(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CorrelatedResponse> {
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(MessagingError::NotAnObject),
        };
        let token = ensure_token(&mut body);
        let base = topics::response_base(topic).to_owned();

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.shared.waiters.lock();
            if waiters.contains_key(&token) {
                return Err(MessagingError::DuplicateToken(token));
            }
            waiters.insert(
                token.clone(),
                Waiter {
                    base: base.clone(),
                    tx,
                },
            );
        }
        let mut guard = CallGuard {
            shared: self.shared.clone(),
            transport: self.transport.clone(),
            token: token.clone(),
            base: None,
            ack_timeout: self.ack_timeout,
        };

        if let Err(err) = self.acquire(&base).await {
            self.record("error", None);
            return Err(err);
        }
        guard.base = Some(base.clone());

        let started = Instant::now();
        let bytes = Bytes::from(serde_json::to_vec(&Value::Object(body))?);
        if let Err(err) = self.transport.publish(topic, self.qos, bytes).await {
            guard.release().await;
            self.record("error", None);
            return Err(err);
        }
        debug!(topic, token = %token, "correlated request published");

        let outcome = tokio::time::timeout(timeout, rx).await;
        guard.release().await;
        match outcome {
            Ok(Ok(response)) => {
                let label = match response.outcome {
                    ResponseOutcome::Accepted => "accepted",
                    ResponseOutcome::Rejected => "rejected",
                };
                self.record(label, Some(started.elapsed()));
                Ok(response)
            }
            Ok(Err(_)) => {
                self.record("error", None);
                Err(MessagingError::Closed)
            }
            Err(_) => {
                self.record("timeout", None);
                warn!(topic, token = %token, ?timeout, "correlated request timed out");
                Err(MessagingError::RequestTimeout {
                    topic: topic.to_owned(),
                    token,
                    timeout,
                })
            }
        }
    }

    /// Like [`Correlator::call`], treating a rejection as an error.
    pub async fn call_accepted(&self, topic: &str, payload: Value, timeout: Duration) -> Result<Value> {
        self.call(topic, payload, timeout).await?.into_accepted()
    }

    async fn acquire(&self, base: &str) -> Result<()> {
        let mut subscriptions = self.shared.subscriptions.lock().await;
        if let Some(count) = subscriptions.get_mut(base) {
            *count += 1;
            return Ok(());
        }
        let accepted = topics::accepted(base);
        let rejected = topics::rejected(base);
        subscribe_and_wait(self.transport.as_ref(), &accepted, self.qos, self.ack_timeout).await?;
        if let Err(err) =
            subscribe_and_wait(self.transport.as_ref(), &rejected, self.qos, self.ack_timeout).await
        {
            let _ = unsubscribe_and_wait(self.transport.as_ref(), &accepted, self.ack_timeout).await;
            return Err(err);
        }
        subscriptions.insert(base.to_owned(), 1);
        Ok(())
    }

    fn record(&self, outcome: &str, elapsed: Option<Duration>) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_call(outcome, elapsed);
        }
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn ensure_token(body: &mut Map<String, Value>) -> String {
    match body.get(CLIENT_TOKEN_FIELD) {
        Some(Value::String(token)) if !token.is_empty() => token.clone(),
        _ => {
            let token = Uuid::new_v4().to_string();
            body.insert(CLIENT_TOKEN_FIELD.to_owned(), Value::String(token.clone()));
            token
        }
    }
}

/// Removes the waiter and releases the response subscriptions of one call.
/// When the call future is dropped mid-flight the release runs on a spawned task.
struct CallGuard {
    shared: Arc<Shared>,
    transport: Arc<dyn MqttTransport>,
    token: String,
    base: Option<String>,
    ack_timeout: Duration,
}

impl CallGuard {
    async fn release(&mut self) {
        self.shared.waiters.lock().remove(&self.token);
        if let Some(base) = self.base.take() {
            release(&self.shared, self.transport.as_ref(), &base, self.ack_timeout).await;
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.shared.waiters.lock().remove(&self.token);
        if let Some(base) = self.base.take() {
            let shared = self.shared.clone();
            let transport = self.transport.clone();
            let ack_timeout = self.ack_timeout;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    release(&shared, transport.as_ref(), &base, ack_timeout).await;
                });
            }
        }
    }
}

async fn release(shared: &Shared, transport: &dyn MqttTransport, base: &str, ack_timeout: Duration) {
    let mut subscriptions = shared.subscriptions.lock().await;
    let remaining = match subscriptions.get_mut(base) {
        Some(count) => {
            *count = count.saturating_sub(1);
            *count
        }
        None => return,
    };
    if remaining > 0 {
        return;
    }
    subscriptions.remove(base);
    for filter in [topics::accepted(base), topics::rejected(base)] {
        if let Err(err) = unsubscribe_and_wait(transport, &filter, ack_timeout).await {
            debug!(filter = %filter, error = %err, "response unsubscribe failed");
        }
    }
}

async fn dispatch(mut inbound: broadcast::Receiver<InboundMessage>, shared: Weak<Shared>) {
    loop {
        let message = match inbound.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "correlator fell behind inbound traffic");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        route(&shared, message);
    }
}

fn route(shared: &Shared, message: InboundMessage) {
    let (base, outcome) = if let Some(base) = message.topic.strip_suffix("/accepted") {
        (base, ResponseOutcome::Accepted)
    } else if let Some(base) = message.topic.strip_suffix("/rejected") {
        (base, ResponseOutcome::Rejected)
    } else {
        return;
    };
    let payload = match message.value() {
        Ok(payload) => payload,
        Err(_) => return,
    };
    let Some(token) = payload.get(CLIENT_TOKEN_FIELD).and_then(Value::as_str) else {
        return;
    };
    let waiter = {
        let mut waiters = shared.waiters.lock();
        match waiters.get(token) {
            Some(waiter) if waiter.base == base => waiters.remove(token),
            _ => None,
        }
    };
    if let Some(waiter) = waiter {
        trace!(topic = %message.topic, token, "correlated response matched");
        let _ = waiter.tx.send(CorrelatedResponse {
            outcome,
            topic: message.topic.clone(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AckMode, LoopbackTransport};
    use serde_json::json;

    fn correlator(transport: &LoopbackTransport) -> Correlator {
        Correlator::new(Arc::new(transport.clone()))
    }

    /// Answer every request on `request_topic` with `reply(token)` on `suffix`.
    fn responder(
        transport: &LoopbackTransport,
        request_topic: &'static str,
        suffix: &'static str,
        reply: fn(&str) -> Value,
    ) {
        let mut outbound = transport.outbound();
        let transport = transport.clone();
        tokio::spawn(async move {
            while let Ok(message) = outbound.recv().await {
                if message.topic != request_topic {
                    continue;
                }
                let token = message.json()[CLIENT_TOKEN_FIELD]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned();
                let topic = format!("{}/{}", topics::response_base(request_topic), suffix);
                transport.inject_json(&topic, &reply(&token));
            }
        });
    }

    #[tokio::test]
    async fn accepted_response_is_matched_by_token() {
        let transport = LoopbackTransport::connected();
        responder(&transport, "$aws/rules/fleet/things/t1/provision", "accepted", |token| {
            json!({"clientToken": token, "ok": true})
        });
        let correlator = correlator(&transport);
        let response = correlator
            .call(
                "$aws/rules/fleet/things/t1/provision",
                json!({}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(response.outcome, ResponseOutcome::Accepted);
        assert_eq!(response.topic, "fleet/things/t1/provision/accepted");
        assert_eq!(response.payload["ok"], true);

        // subscribe-before-publish on the stripped response base
        assert_eq!(
            transport.subscribe_log(),
            vec![
                "fleet/things/t1/provision/accepted".to_owned(),
                "fleet/things/t1/provision/rejected".to_owned()
            ]
        );
        assert!(transport.active_subscriptions().is_empty());
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn rejected_response_surfaces_as_error() {
        let transport = LoopbackTransport::connected();
        responder(&transport, "svc/req", "rejected", |token| {
            json!({"clientToken": token, "code": "InvalidRequest"})
        });
        let correlator = correlator(&transport);
        let err = correlator
            .call_accepted("svc/req", json!({"a": 1}), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            MessagingError::Rejected { topic, payload } => {
                assert_eq!(topic, "svc/req/rejected");
                assert_eq!(payload["code"], "InvalidRequest");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn caller_token_is_preserved() {
        let transport = LoopbackTransport::connected();
        responder(&transport, "svc/req", "accepted", |token| {
            json!({"clientToken": token})
        });
        let correlator = correlator(&transport);
        correlator
            .call(
                "svc/req",
                json!({"clientToken": "mine"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let sent = transport.published_to("svc/req");
        assert_eq!(sent[0].json()["clientToken"], "mine");
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_tokens_are_ignored_and_call_times_out() {
        let transport = LoopbackTransport::connected();
        responder(&transport, "svc/req", "accepted", |_| {
            json!({"clientToken": "someone-else"})
        });
        let correlator = correlator(&transport);
        let err = correlator
            .call("svc/req", json!({}), Duration::from_secs(15))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::RequestTimeout { .. }));
        assert!(err.is_timeout());
        assert!(transport.active_subscriptions().is_empty());
        assert_eq!(
            transport.unsubscribe_log(),
            vec!["svc/req/accepted".to_owned(), "svc/req/rejected".to_owned()]
        );
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_share_subscriptions() {
        let transport = LoopbackTransport::connected();
        let correlator = Arc::new(correlator(&transport));
        let mut outbound = transport.outbound();

        let first = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .call("svc/req", json!({"clientToken": "one"}), Duration::from_secs(5))
                    .await
            })
        };
        let second = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .call("svc/req", json!({"clientToken": "two"}), Duration::from_secs(5))
                    .await
            })
        };

        // both requests are out before any answer
        outbound.recv().await.unwrap();
        outbound.recv().await.unwrap();
        transport.inject_json("svc/req/accepted", &json!({"clientToken": "two", "n": 2}));
        transport.inject_json("svc/req/accepted", &json!({"clientToken": "one", "n": 1}));

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.payload["n"], 1);
        assert_eq!(second.payload["n"], 2);
        assert_eq!(transport.subscribe_log().len(), 2);
        assert!(transport.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn duplicate_token_is_refused() {
        let transport = LoopbackTransport::connected();
        transport.set_ack_mode(AckMode::Never);
        let correlator = Arc::new(correlator(&transport).with_ack_timeout(Duration::from_secs(60)));
        let pending = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .call("svc/req", json!({"clientToken": "t"}), Duration::from_secs(60))
                    .await
            })
        };
        while correlator.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let err = correlator
            .call("svc/req", json!({"clientToken": "t"}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::DuplicateToken(_)));
        pending.abort();
    }

    #[tokio::test]
    async fn non_object_payload_is_refused() {
        let transport = LoopbackTransport::connected();
        let correlator = correlator(&transport);
        let err = correlator
            .call("svc/req", json!([1, 2]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::NotAnObject));
        assert!(transport.subscribe_log().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_releases_subscriptions() {
        let transport = LoopbackTransport::connected();
        transport.fail_publishes(true);
        let correlator = correlator(&transport);
        let err = correlator
            .call("svc/req", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Transport(_)));
        assert!(transport.active_subscriptions().is_empty());
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_call_cleans_up() {
        let transport = LoopbackTransport::connected();
        let correlator = Arc::new(correlator(&transport));
        let mut outbound = transport.outbound();
        let call = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .call("svc/req", json!({}), Duration::from_secs(60))
                    .await
            })
        };
        outbound.recv().await.unwrap();
        call.abort();
        let _ = call.await;
        for _ in 0..100 {
            if transport.active_subscriptions().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(transport.active_subscriptions().is_empty());
        assert_eq!(correlator.in_flight(), 0);
    }
}
