//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Bounded waits on connect and subscription acknowledgements."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Each helper turns one acknowledgement into an awaited call with a budget.
//! Acknowledgements are matched per request by the binding, so any number of
//! waits may be outstanding on one transport at the same time, and other
//! observers of the connection state keep seeing every change.

use std::time::Duration;

use crate::qos::DeliveryGuarantee;
use crate::transport::MqttTransport;
use crate::types::ConnectionState;
use crate::{MessagingError, Result};

/// Wait until the binding reports a broker session; returns its session number.
pub async fn connect_and_wait<T>(transport: &T, timeout: Duration) -> Result<u64>
where
    T: MqttTransport + ?Sized,
{
    let mut state = transport.connection();
    let wait = async {
        loop {
            if let ConnectionState::Connected { session } = *state.borrow_and_update() {
                return Ok(session);
            }
            state
                .changed()
                .await
                .map_err(|_| MessagingError::Closed)?;
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| MessagingError::ConnectTimeout(timeout))?
}

/// Subscribe to `filter` and wait for the SUBACK.
pub async fn subscribe_and_wait<T>(
    transport: &T,
    filter: &str,
    qos: DeliveryGuarantee,
    timeout: Duration,
) -> Result<()>
where
    T: MqttTransport + ?Sized,
{
    tokio::time::timeout(timeout, transport.subscribe(filter, qos))
        .await
        .map_err(|_| MessagingError::AckTimeout {
            operation: "subscribe",
            topic: filter.to_owned(),
            timeout,
        })?
}

/// Unsubscribe from `filter` and wait for the UNSUBACK.
pub async fn unsubscribe_and_wait<T>(transport: &T, filter: &str, timeout: Duration) -> Result<()>
where
    T: MqttTransport + ?Sized,
{
    tokio::time::timeout(timeout, transport.unsubscribe(filter))
        .await
        .map_err(|_| MessagingError::AckTimeout {
            operation: "unsubscribe",
            topic: filter.to_owned(),
            timeout,
        })?
}

/// Subscribe to every filter in order, stopping at the first failure.
pub async fn subscribe_all<T>(
    transport: &T,
    filters: &[String],
    qos: DeliveryGuarantee,
    timeout: Duration,
) -> Result<()>
where
    T: MqttTransport + ?Sized,
{
    for filter in filters {
        subscribe_and_wait(transport, filter, qos, timeout).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AckMode, LoopbackTransport};

    #[tokio::test]
    async fn connect_returns_immediately_when_connected() {
        let transport = LoopbackTransport::connected();
        let session = connect_and_wait(&transport, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(session, 1);
    }

    #[tokio::test]
    async fn connect_resolves_on_later_connack() {
        let transport = LoopbackTransport::new();
        let background = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            background.connect();
        });
        let session = connect_and_wait(&transport, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out() {
        let transport = LoopbackTransport::new();
        let err = connect_and_wait(&transport, Duration::from_secs(15))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::ConnectTimeout(_)));
    }

    #[tokio::test]
    async fn other_connection_observers_still_see_the_change() {
        let transport = LoopbackTransport::new();
        let mut observer = transport.connection();
        let background = transport.clone();
        tokio::spawn(async move { background.connect() });
        connect_and_wait(&transport, Duration::from_secs(5))
            .await
            .unwrap();
        observer.changed().await.unwrap();
        assert!(observer.borrow().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_subscribe_times_out() {
        let transport = LoopbackTransport::connected();
        transport.set_ack_mode(AckMode::Never);
        let err = subscribe_and_wait(
            &transport,
            "a/b",
            DeliveryGuarantee::AtLeastOnce,
            Duration::from_secs(15),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            MessagingError::AckTimeout {
                operation: "subscribe",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn refused_subscription_is_an_error() {
        let transport = LoopbackTransport::connected();
        transport.set_ack_mode(AckMode::Refuse);
        let err = subscribe_all(
            &transport,
            &["a".to_owned(), "b".to_owned()],
            DeliveryGuarantee::AtLeastOnce,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MessagingError::SubscribeRefused(ref f) if f == "a"));
        assert_eq!(transport.subscribe_log(), vec!["a".to_owned()]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_filter() {
        let transport = LoopbackTransport::connected();
        subscribe_and_wait(
            &transport,
            "a/b",
            DeliveryGuarantee::AtLeastOnce,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        unsubscribe_and_wait(&transport, "a/b", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(transport.active_subscriptions().is_empty());
    }
}
