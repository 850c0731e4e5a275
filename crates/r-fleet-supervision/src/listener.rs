//! ---
//! fleet_section: "07-resilience-fault-tolerance"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "supervisord event-listener wire protocol."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! supervisord talks to event listeners over the listener's stdin/stdout.
//! The listener announces `READY`, receives a header line of `key:value`
//! tokens followed by `len` bytes of body, and acknowledges with a `RESULT`
//! reply before announcing `READY` again.

use std::collections::BTreeMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::events::{ProcessStateEvent, PROCESS_STATE_PREFIX};
use crate::{Result, SupervisionError};

/// Readiness announcement.
pub const READY: &str = "READY\n";

const SUPERVISOR_STATE_PREFIX: &str = "SUPERVISOR_STATE_CHANGE_";

/// Acknowledgement of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerReply {
    /// Event handled.
    Ok,
    /// Event rejected; supervisord will resend it.
    Fail,
}

impl ListenerReply {
    /// Wire form of the reply.
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerReply::Ok => "RESULT 2\nOK",
            ListenerReply::Fail => "RESULT 4\nFAIL",
        }
    }
}

/// One event received from supervisord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerEvent {
    /// Header tokens.
    pub header: BTreeMap<String, String>,
    /// Raw body.
    pub body: String,
}

/// Decoded event, grouped the way the bridge republishes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `PROCESS_STATE_*`.
    Process(ProcessStateEvent),
    /// `SUPERVISOR_STATE_CHANGE_*`.
    Supervisor {
        /// Event name.
        eventname: String,
    },
    /// Any other event type; single-line bodies are split into tokens.
    Other {
        /// Event name.
        eventname: String,
        /// Body tokens, or the raw body under `body` when it spans lines.
        fields: BTreeMap<String, String>,
    },
}

impl ListenerEvent {
    /// Event name from the header.
    pub fn eventname(&self) -> Result<&str> {
        self.header
            .get("eventname")
            .map(String::as_str)
            .ok_or_else(|| SupervisionError::Protocol("header without eventname".into()))
    }

    /// Decode the event by type.
    pub fn notification(&self) -> Result<Notification> {
        let eventname = self.eventname()?.to_owned();
        if eventname.starts_with(PROCESS_STATE_PREFIX) {
            let mut fields = parse_tokens(&self.body)?;
            let processname = fields
                .remove("processname")
                .ok_or_else(|| SupervisionError::Protocol("process event without processname".into()))?;
            let pid = fields.get("pid").and_then(|pid| pid.parse().ok());
            let expected = fields.get("expected").and_then(|flag| flag.parse().ok());
            return Ok(Notification::Process(ProcessStateEvent {
                eventname,
                processname,
                groupname: fields.remove("groupname").unwrap_or_default(),
                from_state: fields.remove("from_state").unwrap_or_default(),
                pid,
                expected,
            }));
        }
        if eventname.starts_with(SUPERVISOR_STATE_PREFIX) {
            return Ok(Notification::Supervisor { eventname });
        }
        let fields = if self.body.trim_end().contains('\n') {
            BTreeMap::from([("body".to_owned(), self.body.clone())])
        } else {
            parse_tokens(&self.body)?
        };
        Ok(Notification::Other { eventname, fields })
    }
}

/// Split `key:value key:value` into a map.
pub fn parse_tokens(line: &str) -> Result<BTreeMap<String, String>> {
    line.split_whitespace()
        .map(|token| {
            token
                .split_once(':')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .ok_or_else(|| SupervisionError::Protocol(format!("malformed token {token:?}")))
        })
        .collect()
}

/// Read the next event; `None` once the input is closed.
pub async fn read_event<R>(reader: &mut R) -> Result<Option<ListenerEvent>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let header = parse_tokens(&line)?;
    let len: usize = header
        .get("len")
        .and_then(|len| len.parse().ok())
        .ok_or_else(|| SupervisionError::Protocol(format!("header without len: {line:?}")))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let body = String::from_utf8(body)
        .map_err(|err| SupervisionError::Protocol(format!("body is not utf-8: {err}")))?;
    Ok(Some(ListenerEvent { header, body }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "ver:3.0 server:supervisor serial:21 pool:listener poolserial:10 eventname:PROCESS_STATE_FATAL len:";

    fn frame(header_prefix: &str, body: &str) -> String {
        format!("{}{}\n{}", header_prefix, body.len(), body)
    }

    #[tokio::test]
    async fn reads_consecutive_events() {
        let body = "processname:jobs_sample1 groupname:jobs_sample1 from_state:BACKOFF";
        let input = format!("{}{}", frame(HEADER, body), frame(HEADER, body));
        let mut reader = tokio::io::BufReader::new(input.as_bytes());

        let first = read_event(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.eventname().unwrap(), "PROCESS_STATE_FATAL");
        assert_eq!(first.body, body);
        assert!(read_event(&mut reader).await.unwrap().is_some());
        assert!(read_event(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn header_without_len_is_rejected() {
        let mut reader = tokio::io::BufReader::new("eventname:TICK_5\n".as_bytes());
        assert!(matches!(
            read_event(&mut reader).await,
            Err(SupervisionError::Protocol(_))
        ));
    }

    #[test]
    fn process_events_are_decoded() {
        let event = ListenerEvent {
            header: parse_tokens("eventname:PROCESS_STATE_EXITED len:0").unwrap(),
            body: "processname:cat groupname:cat from_state:RUNNING expected:0 pid:2766".into(),
        };
        match event.notification().unwrap() {
            Notification::Process(process) => {
                assert_eq!(process.processname, "cat");
                assert_eq!(process.pid, Some(2766));
                assert_eq!(process.expected, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_events_keep_multiline_bodies() {
        let event = ListenerEvent {
            header: parse_tokens("eventname:PROCESS_LOG_STDOUT len:0").unwrap(),
            body: "processname:cat pid:1\nhello\nworld".into(),
        };
        match event.notification().unwrap() {
            Notification::Other { fields, .. } => assert!(fields["body"].contains("world")),
            other => panic!("unexpected {other:?}"),
        }

        let state = ListenerEvent {
            header: parse_tokens("eventname:SUPERVISOR_STATE_CHANGE_RUNNING len:0").unwrap(),
            body: String::new(),
        };
        assert_eq!(
            state.notification().unwrap(),
            Notification::Supervisor {
                eventname: "SUPERVISOR_STATE_CHANGE_RUNNING".into()
            }
        );
    }

    #[test]
    fn replies_match_the_protocol() {
        assert_eq!(ListenerReply::Ok.as_str(), "RESULT 2\nOK");
        assert_eq!(ListenerReply::Fail.as_str(), "RESULT 4\nFAIL");
    }
}
