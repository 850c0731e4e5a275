//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Broker topic scheme and filter matching."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Topic names used by the agent.
//!
//! Jobs and shadows live under the managed broker's reserved
//! `$aws/things/{thing}/...` hierarchy. Requests that go through a broker-side
//! rule are published under `$aws/rules/{rule}/...`; the rule output comes
//! back on the same topic without the `$aws/rules/` routing prefix.

/// Routing prefix of rule topics.
pub const RULE_PREFIX: &str = "$aws/rules/";
/// Suffix of positive responses.
pub const ACCEPTED: &str = "accepted";
/// Suffix of negative responses.
pub const REJECTED: &str = "rejected";
/// Filter matching every supervised process state event.
pub const PROCESS_STATE_FILTER: &str = "supervisor/processes/+/events/PROCESS_STATE";

/// Base topic that correlated responses for `topic` arrive under.
pub fn response_base(topic: &str) -> &str {
    topic.strip_prefix(RULE_PREFIX).unwrap_or(topic)
}

/// `{base}/accepted`
pub fn accepted(base: &str) -> String {
    format!("{base}/{ACCEPTED}")
}

/// `{base}/rejected`
pub fn rejected(base: &str) -> String {
    format!("{base}/{REJECTED}")
}

/// Match a topic against an MQTT filter with `+` and `#` wildcards.
pub fn matches(filter: &str, topic: &str) -> bool {
    // `$`-prefixed topics never match a leading wildcard.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Topic level at `index` (0-based).
pub fn level(topic: &str, index: usize) -> Option<&str> {
    topic.split('/').nth(index)
}

/// Broker-maintained connection state of a client.
pub fn presence_state(thing: &str) -> String {
    format!("$SYS/broker/connection/{thing}/state")
}

/// Secure tunnel notifications.
pub fn tunnels_notify(thing: &str) -> String {
    format!("$aws/things/{thing}/tunnels/notify")
}

/// Process state events published by the supervisor event bridge.
pub fn process_state(program: &str) -> String {
    format!("supervisor/processes/{program}/events/PROCESS_STATE")
}

/// Per-event-name process topic.
pub fn process_event(program: &str, event_name: &str) -> String {
    format!("supervisor/processes/{program}/events/{event_name}")
}

/// Supervisor-wide state change topic.
pub fn supervisor_event(event_name: &str) -> String {
    format!("supervisor/events/{event_name}")
}

/// Program name carried in a process state topic.
pub fn process_from_topic(topic: &str) -> Option<&str> {
    if matches(PROCESS_STATE_FILTER, topic) {
        level(topic, 2)
    } else {
        None
    }
}

/// Rule topic the agent forwards its log records to.
pub fn log(topic_prefix: &str, thing: &str) -> String {
    format!("{RULE_PREFIX}{topic_prefix}/things/{thing}/log")
}

/// Phase 1 provisioning request topic.
pub fn provision_client(topic_prefix: &str, client_id: &str) -> String {
    format!("{RULE_PREFIX}{topic_prefix}/clients/{client_id}/provision")
}

/// Phase 2 provisioning request topic.
pub fn provision_thing(topic_prefix: &str, thing: &str) -> String {
    format!("{RULE_PREFIX}{topic_prefix}/things/{thing}/provision")
}

/// Topics of the managed jobs protocol for one thing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTopics {
    base: String,
}

/// Classified inbound jobs topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTopic {
    /// Pending executions snapshot.
    GetAccepted,
    /// Snapshot request refused.
    GetRejected,
    /// Next execution handed out.
    StartNextAccepted,
    /// Start-next refused.
    StartNextRejected,
    /// Execution description for a job.
    DescribeAccepted(String),
    /// Execution description refused for a job.
    DescribeRejected(String),
    /// Status update applied.
    UpdateAccepted(String),
    /// Status update refused.
    UpdateRejected(String),
    /// Pending list changed.
    Notify,
    /// Next pending execution changed.
    NotifyNext,
}

impl JobTopics {
    /// Topics for `thing`.
    pub fn new(thing: &str) -> Self {
        Self {
            base: format!("$aws/things/{thing}/jobs"),
        }
    }

    /// Request the pending executions snapshot.
    pub fn get(&self) -> String {
        format!("{}/get", self.base)
    }

    /// Request the next pending execution to be started.
    pub fn start_next(&self) -> String {
        format!("{}/start-next", self.base)
    }

    /// Request the execution description of a job.
    pub fn describe(&self, job_id: &str) -> String {
        format!("{}/{}/get", self.base, job_id)
    }

    /// Update the status of a job execution.
    pub fn update(&self, job_id: &str) -> String {
        format!("{}/{}/update", self.base, job_id)
    }

    /// Filters the reconciler subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        let base = &self.base;
        vec![
            accepted(&format!("{base}/get")),
            rejected(&format!("{base}/get")),
            accepted(&format!("{base}/start-next")),
            rejected(&format!("{base}/start-next")),
            accepted(&format!("{base}/+/get")),
            rejected(&format!("{base}/+/get")),
            accepted(&format!("{base}/+/update")),
            rejected(&format!("{base}/+/update")),
            format!("{base}/notify"),
            format!("{base}/notify-next"),
        ]
    }

    /// Classify an inbound topic, `None` when it is not a jobs topic of this thing.
    pub fn classify(&self, topic: &str) -> Option<JobTopic> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        let levels: Vec<&str> = rest.split('/').collect();
        let kind = match levels.as_slice() {
            ["get", ACCEPTED] => JobTopic::GetAccepted,
            ["get", REJECTED] => JobTopic::GetRejected,
            ["start-next", ACCEPTED] => JobTopic::StartNextAccepted,
            ["start-next", REJECTED] => JobTopic::StartNextRejected,
            ["notify"] => JobTopic::Notify,
            ["notify-next"] => JobTopic::NotifyNext,
            [job, "get", ACCEPTED] => JobTopic::DescribeAccepted((*job).to_owned()),
            [job, "get", REJECTED] => JobTopic::DescribeRejected((*job).to_owned()),
            [job, "update", ACCEPTED] => JobTopic::UpdateAccepted((*job).to_owned()),
            [job, "update", REJECTED] => JobTopic::UpdateRejected((*job).to_owned()),
            _ => return None,
        };
        Some(kind)
    }
}

/// Topics of one named shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowTopics {
    base: String,
}

/// Classified inbound shadow topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowTopic {
    /// Full document.
    GetAccepted,
    /// Document request refused (404 when no shadow exists).
    GetRejected,
    /// Update applied.
    UpdateAccepted,
    /// Update refused.
    UpdateRejected,
    /// Desired and reported disagree.
    UpdateDelta,
    /// Previous and current document after an update.
    UpdateDocuments,
    /// Shadow deleted.
    DeleteAccepted,
    /// Delete refused.
    DeleteRejected,
}

impl ShadowTopics {
    /// Topics of the shadow `name` of `thing`.
    pub fn new(thing: &str, name: &str) -> Self {
        Self {
            base: format!("$aws/things/{thing}/shadow/name/{name}"),
        }
    }

    /// Request the full document.
    pub fn get(&self) -> String {
        format!("{}/get", self.base)
    }

    /// Update the document.
    pub fn update(&self) -> String {
        format!("{}/update", self.base)
    }

    /// Delete the document.
    pub fn delete(&self) -> String {
        format!("{}/delete", self.base)
    }

    /// Filters the reconciler subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        let get = self.get();
        let update = self.update();
        let delete = self.delete();
        vec![
            accepted(&get),
            rejected(&get),
            accepted(&update),
            rejected(&update),
            format!("{update}/delta"),
            format!("{update}/documents"),
            accepted(&delete),
            rejected(&delete),
        ]
    }

    /// Classify an inbound topic, `None` when it belongs to another shadow.
    pub fn classify(&self, topic: &str) -> Option<ShadowTopic> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        let kind = match rest {
            "get/accepted" => ShadowTopic::GetAccepted,
            "get/rejected" => ShadowTopic::GetRejected,
            "update/accepted" => ShadowTopic::UpdateAccepted,
            "update/rejected" => ShadowTopic::UpdateRejected,
            "update/delta" => ShadowTopic::UpdateDelta,
            "update/documents" => ShadowTopic::UpdateDocuments,
            "delete/accepted" => ShadowTopic::DeleteAccepted,
            "delete/rejected" => ShadowTopic::DeleteRejected,
            _ => return None,
        };
        Some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_prefix_is_stripped_for_responses() {
        assert_eq!(
            response_base("$aws/rules/baseline/clients/abc/provision"),
            "baseline/clients/abc/provision"
        );
        assert_eq!(
            response_base("$aws/things/t1/jobs/get"),
            "$aws/things/t1/jobs/get"
        );
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/d"));
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("a/#", "a"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("+/x", "$SYS/x"));
        assert!(matches(
            "$aws/things/t1/jobs/+/get/accepted",
            "$aws/things/t1/jobs/J1/get/accepted"
        ));
        assert!(!matches(
            "$aws/things/t1/jobs/+/get/accepted",
            "$aws/things/t1/jobs/get/accepted"
        ));
    }

    #[test]
    fn classifies_job_topics() {
        let topics = JobTopics::new("t1");
        assert_eq!(
            topics.classify("$aws/things/t1/jobs/get/accepted"),
            Some(JobTopic::GetAccepted)
        );
        assert_eq!(
            topics.classify("$aws/things/t1/jobs/J7/get/rejected"),
            Some(JobTopic::DescribeRejected("J7".into()))
        );
        assert_eq!(
            topics.classify("$aws/things/t1/jobs/notify-next"),
            Some(JobTopic::NotifyNext)
        );
        assert_eq!(topics.classify("$aws/things/t2/jobs/notify"), None);
        assert_eq!(topics.classify("$aws/things/t1/jobs/J7/unknown"), None);
        assert_eq!(topics.describe("J7"), "$aws/things/t1/jobs/J7/get");
    }

    #[test]
    fn every_job_subscription_is_classifiable() {
        let topics = JobTopics::new("t1");
        for filter in topics.subscriptions() {
            let concrete = filter.replace('+', "J1");
            assert!(topics.classify(&concrete).is_some(), "{concrete}");
        }
    }

    #[test]
    fn classifies_shadow_topics() {
        let topics = ShadowTopics::new("t1", "sample");
        assert_eq!(
            topics.classify("$aws/things/t1/shadow/name/sample/update/documents"),
            Some(ShadowTopic::UpdateDocuments)
        );
        assert_eq!(
            topics.classify("$aws/things/t1/shadow/name/other/update/documents"),
            None
        );
        assert_eq!(topics.subscriptions().len(), 8);
    }

    #[test]
    fn process_name_is_extracted() {
        assert_eq!(
            process_from_topic(&process_state("jobs_sample1")),
            Some("jobs_sample1")
        );
        assert_eq!(process_from_topic("supervisor/events/X"), None);
    }
}
