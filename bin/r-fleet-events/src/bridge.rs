//! ---
//! fleet_section: "07-resilience-fault-tolerance"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Event-listener loop republishing supervisord notifications."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use r_fleet_msg::{topics, DeliveryGuarantee, MqttTransport, MqttTransportExt};
use r_fleet_supervision::{read_event, ListenerReply, Notification, READY};
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Serve supervisord until it closes our stdin; returns the number of events handled.
pub async fn serve<R, W>(reader: &mut R, writer: &mut W, transport: &dyn MqttTransport) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut handled = 0;
    loop {
        writer.write_all(READY.as_bytes()).await?;
        writer.flush().await?;
        let Some(event) = read_event(reader)
            .await
            .context("failed to read supervisor event")?
        else {
            return Ok(handled);
        };
        handled += 1;

        let reply = match event.notification() {
            Ok(notification) => forward(transport, notification).await,
            Err(err) => {
                // a FAIL reply makes supervisord resend the same undecodable event
                warn!(error = %err, header = ?event.header, "undecodable supervisor event skipped");
                ListenerReply::Ok
            }
        };
        writer.write_all(reply.as_str().as_bytes()).await?;
        writer.flush().await?;
    }
}

async fn forward(transport: &dyn MqttTransport, notification: Notification) -> ListenerReply {
    let qos = DeliveryGuarantee::ExactlyOnce;
    let outcome = match &notification {
        Notification::Process(event) => {
            let state = transport
                .publish_json(&topics::process_state(&event.processname), qos, event)
                .await;
            match state {
                Ok(()) => {
                    transport
                        .publish_json(
                            &topics::process_event(&event.processname, &event.eventname),
                            qos,
                            event,
                        )
                        .await
                }
                Err(err) => Err(err),
            }
        }
        Notification::Supervisor { eventname } => {
            transport
                .publish_json(
                    &topics::supervisor_event(eventname),
                    qos,
                    &json!({ "eventname": eventname }),
                )
                .await
        }
        Notification::Other { eventname, .. } => {
            debug!(event = %eventname, "event type not forwarded");
            Ok(())
        }
    };
    match outcome {
        Ok(()) => ListenerReply::Ok,
        Err(err) => {
            warn!(error = %err, "supervisor event not published; supervisord will resend");
            ListenerReply::Fail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_fleet_msg::LoopbackTransport;
    use tokio::io::BufReader;

    fn frame(eventname: &str, body: &str) -> String {
        format!(
            "ver:3.0 server:supervisor serial:1 pool:fleet poolserial:1 eventname:{} len:{}\n{}",
            eventname,
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn process_events_are_published_on_both_topics() {
        let transport = LoopbackTransport::connected();
        let input = format!(
            "{}{}",
            frame(
                "PROCESS_STATE_FATAL",
                "processname:jobs_sample1 groupname:jobs_sample1 from_state:BACKOFF"
            ),
            frame("SUPERVISOR_STATE_CHANGE_RUNNING", "")
        );
        let mut reader = BufReader::new(input.as_bytes());
        let mut output = Vec::new();

        let handled = serve(&mut reader, &mut output, &transport).await.unwrap();

        assert_eq!(handled, 2);
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "READY\nRESULT 2\nOKREADY\nRESULT 2\nOKREADY\n"
        );
        let state = transport.published_to("supervisor/processes/jobs_sample1/events/PROCESS_STATE");
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].qos, DeliveryGuarantee::ExactlyOnce);
        assert_eq!(state[0].json()["eventname"], "PROCESS_STATE_FATAL");
        assert_eq!(state[0].json()["from_state"], "BACKOFF");
        assert_eq!(
            transport
                .published_to("supervisor/processes/jobs_sample1/events/PROCESS_STATE_FATAL")
                .len(),
            1
        );
        assert_eq!(
            transport
                .published_to("supervisor/events/SUPERVISOR_STATE_CHANGE_RUNNING")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_publish_asks_for_resend() {
        let transport = LoopbackTransport::connected();
        transport.fail_publishes(true);
        let input = frame("PROCESS_STATE_EXITED", "processname:ssh groupname:ssh from_state:RUNNING expected:0 pid:77");
        let mut reader = BufReader::new(input.as_bytes());
        let mut output = Vec::new();

        serve(&mut reader, &mut output, &transport).await.unwrap();

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "READY\nRESULT 4\nFAILREADY\n"
        );
    }
}
