//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Job execution reconciliation against the supervision control plane."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Job reconciler.
//!
//! At most one job execution is active at a time. The pending snapshot and
//! notifications only ever lead to requests; the program is started or
//! stopped when an authoritative execution description arrives (start-next or
//! per-job get) and cleared again when the supervisor reports the process gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r_fleet_common::config::JobsConfig;
use r_fleet_logging::{fleet_debug, fleet_error, fleet_info, fleet_warn, LogContext};
use r_fleet_metrics::AgentMetrics;
use r_fleet_msg::topics::{self, JobTopic, JobTopics, PROCESS_STATE_FILTER};
use r_fleet_msg::types::{
    ExecutionEnvelope, JobExecution, JobStatus, JobUpdateRequest, PendingJobs, RejectedResponse,
};
use r_fleet_msg::{
    subscribe_all, DeliveryGuarantee, InboundMessage, MqttTransport, MqttTransportExt,
};
use r_fleet_persistence::JobDescriptorStore;
use r_fleet_supervision::{ProcessControl, ProcessState, ProcessStateEvent};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::reconciler::Reconciler;

/// Rejection code of a per-job get for an execution that already finished.
const TERMINAL_STATE_REACHED: &str = "TerminalStateReached";

/// Lifecycle of the reconciler's single job slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// No execution is active.
    Idle,
    /// The supervised program is being started.
    Starting,
    /// An execution is active and its program was started.
    Active,
    /// The active execution is being stopped so another one can start.
    StoppingForReplacement,
}

/// Timers and naming used by the job reconciler.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub step_timeout: Duration,
    pub heartbeat: Duration,
    pub program_prefix: String,
    pub ack_timeout: Duration,
}

impl JobSettings {
    pub fn from_config(config: &JobsConfig, ack_timeout: Duration) -> Self {
        Self {
            step_timeout: config.step_timeout,
            heartbeat: config.heartbeat,
            program_prefix: config.program_prefix.clone(),
            ack_timeout,
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            heartbeat: Duration::from_secs(600),
            program_prefix: "jobs_".to_owned(),
            ack_timeout: Duration::from_secs(15),
        }
    }
}

/// Drives supervised programs from the remote job queue.
pub struct JobReconciler {
    thing: String,
    topics: JobTopics,
    transport: Arc<dyn MqttTransport>,
    control: Arc<dyn ProcessControl>,
    descriptors: JobDescriptorStore,
    settings: JobSettings,
    state: JobState,
    active: Option<JobExecution>,
    step_deadline: Option<Instant>,
    metrics: Option<AgentMetrics>,
}

impl JobReconciler {
    pub fn new(
        thing: impl Into<String>,
        transport: Arc<dyn MqttTransport>,
        control: Arc<dyn ProcessControl>,
        descriptors: JobDescriptorStore,
        settings: JobSettings,
    ) -> Self {
        let thing = thing.into();
        Self {
            topics: JobTopics::new(&thing),
            thing,
            transport,
            control,
            descriptors,
            settings,
            state: JobState::Idle,
            active: None,
            step_deadline: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Execution currently owning the job slot.
    pub fn active(&self) -> Option<&JobExecution> {
        self.active.as_ref()
    }

    /// Supervisor program name of a job program.
    pub fn supervised_name(&self, program: &str) -> String {
        format!("{}{}", self.settings.program_prefix, program)
    }

    fn active_program(&self) -> Option<String> {
        self.active
            .as_ref()
            .and_then(JobExecution::program)
            .map(|program| self.supervised_name(program))
    }

    async fn request(&self, topic: String) {
        if let Err(err) = self
            .transport
            .publish_empty(&topic, DeliveryGuarantee::AtLeastOnce)
            .await
        {
            fleet_warn!(
                context = LogContext::new().with_thing(&self.thing),
                "request on {} not sent, next heartbeat retries: {}",
                topic,
                err
            );
        }
    }

    async fn request_snapshot(&self) {
        self.request(self.topics.get()).await;
    }

    async fn request_start_next(&self) {
        self.request(self.topics.start_next()).await;
    }

    async fn report(&self, execution: &JobExecution, status: JobStatus, reason: Option<String>) {
        let update = JobUpdateRequest {
            status,
            expected_version: execution.version_number,
            execution_number: execution.execution_number,
            status_details: reason.map(|reason| {
                let mut details = Map::new();
                details.insert("reason".to_owned(), Value::String(reason));
                details
            }),
        };
        let topic = self.topics.update(&execution.job_id);
        match self
            .transport
            .publish_json(&topic, DeliveryGuarantee::AtLeastOnce, &update)
            .await
        {
            Ok(()) => {
                fleet_info!(
                    context = LogContext::new()
                        .with_thing(&self.thing)
                        .with_job(&execution.job_id),
                    "reported {} (version {}, execution {})",
                    status,
                    execution.version_number,
                    execution.execution_number
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_job_report(&status.to_string());
                }
            }
            Err(err) => fleet_warn!(
                context = LogContext::new()
                    .with_thing(&self.thing)
                    .with_job(&execution.job_id),
                "status {} not reported: {}",
                status,
                err
            ),
        }
    }

    fn transition(&self, program: &str, action: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_job_transition(program, action);
            metrics.set_job_active(self.active.is_some());
        }
    }

    fn clear(&mut self) {
        self.active = None;
        self.step_deadline = None;
        self.state = JobState::Idle;
        if let Some(metrics) = &self.metrics {
            metrics.set_job_active(false);
        }
    }

    /// Start the program of `execution`; failures are reported upstream as `FAILED`.
    async fn start(&mut self, execution: JobExecution) {
        self.state = JobState::Starting;
        let job_id = execution.job_id.clone();
        let program = match execution.program() {
            Some(program) if valid_program(program) => program.to_owned(),
            other => {
                let reason = format!("invalid program {:?} in job document", other);
                self.state = JobState::Idle;
                fleet_error!(
                    context = LogContext::new().with_thing(&self.thing).with_job(&job_id),
                    "{}",
                    reason
                );
                self.report(&execution, JobStatus::Failed, Some(reason)).await;
                return;
            }
        };
        let supervised = self.supervised_name(&program);

        if let Err(err) = self.descriptors.write(&program, &execution) {
            self.state = JobState::Idle;
            let reason = format!("descriptor for {program} not written: {err}");
            fleet_error!(
                context = LogContext::new()
                    .with_thing(&self.thing)
                    .with_job(&job_id)
                    .with_program(&supervised),
                "{}",
                reason
            );
            self.report(&execution, JobStatus::Failed, Some(reason)).await;
            return;
        }

        if let Err(err) = self.control.start(&supervised).await {
            if let Some(pid) = self.running_pid(&supervised).await.filter(|pid| *pid != 0) {
                fleet_warn!(
                    context = LogContext::new()
                        .with_thing(&self.thing)
                        .with_job(&job_id)
                        .with_program(&supervised),
                    "start rejected but program runs as pid {}, adopting it: {}",
                    pid,
                    err
                );
                self.activate(execution, &supervised, "adopt");
                return;
            }
            self.state = JobState::Idle;
            let reason = err.to_string();
            fleet_error!(
                context = LogContext::new()
                    .with_thing(&self.thing)
                    .with_job(&job_id)
                    .with_program(&supervised),
                "start failed: {}",
                reason
            );
            self.transition(&supervised, "fail");
            self.report(&execution, JobStatus::Failed, Some(reason)).await;
            return;
        }

        fleet_info!(
            context = LogContext::new()
                .with_thing(&self.thing)
                .with_job(&job_id)
                .with_program(&supervised),
            "job started"
        );
        self.activate(execution, &supervised, "start");
    }

    fn activate(&mut self, execution: JobExecution, supervised: &str, action: &str) {
        self.active = Some(execution);
        self.state = JobState::Active;
        self.step_deadline = Some(Instant::now() + self.settings.step_timeout);
        self.transition(supervised, action);
    }

    /// Pid the supervisor reports for `supervised`, `None` when it cannot tell.
    async fn running_pid(&self, supervised: &str) -> Option<u32> {
        match self.control.pid(supervised).await {
            Ok(pid) => Some(pid),
            Err(err) => {
                fleet_debug!(
                    context = LogContext::new()
                        .with_thing(&self.thing)
                        .with_program(supervised),
                    "pid query failed: {}",
                    err
                );
                None
            }
        }
    }

    /// Stop the active program. Returns `false` when it is still running.
    async fn stop(&mut self) -> bool {
        let Some(active) = &self.active else {
            return true;
        };
        let job_id = active.job_id.clone();
        let Some(supervised) = self.active_program() else {
            self.clear();
            return true;
        };
        let err = match self.control.stop(&supervised).await {
            Ok(()) => {
                fleet_info!(
                    context = LogContext::new()
                        .with_thing(&self.thing)
                        .with_job(&job_id)
                        .with_program(&supervised),
                    "job stopped"
                );
                self.clear();
                self.transition(&supervised, "stop");
                return true;
            }
            Err(err) => err,
        };
        if self.running_pid(&supervised).await == Some(0) {
            fleet_warn!(
                context = LogContext::new()
                    .with_thing(&self.thing)
                    .with_job(&job_id)
                    .with_program(&supervised),
                "stop rejected but program is not running, job released: {}",
                err
            );
            self.clear();
            self.transition(&supervised, "stop");
            return true;
        }
        if self.state == JobState::StoppingForReplacement {
            self.state = JobState::Active;
        }
        fleet_error!(
            context = LogContext::new()
                .with_thing(&self.thing)
                .with_job(&job_id)
                .with_program(&supervised),
            "stop failed, job stays active: {}",
            err
        );
        false
    }

    async fn on_snapshot(&mut self, pending: PendingJobs) {
        if !pending.in_progress_jobs.is_empty() {
            // start-next re-confirms an execution that is already in progress
            self.request_start_next().await;
            return;
        }
        if self.active.is_some() && !self.stop().await {
            return;
        }
        if !pending.queued_jobs.is_empty() {
            self.request_start_next().await;
        } else {
            fleet_debug!(
                context = LogContext::new().with_thing(&self.thing),
                "job queue empty"
            );
        }
    }

    /// Authoritative next execution (start-next accepted).
    async fn on_execution(&mut self, execution: JobExecution) {
        let same_job = self
            .active
            .as_ref()
            .map(|active| active.job_id == execution.job_id);
        match same_job {
            None => self.start(execution).await,
            Some(false) => {
                self.state = JobState::StoppingForReplacement;
                if self.stop().await {
                    self.start(execution).await;
                }
            }
            Some(true) => self.confirm(execution).await,
        }
    }

    /// The active execution was re-confirmed; restart its program if it died.
    async fn confirm(&mut self, execution: JobExecution) {
        let Some(supervised) = self.active_program() else {
            return;
        };
        if let Some(active) = self.active.as_mut() {
            active.version_number = execution.version_number;
            active.execution_number = execution.execution_number;
        }
        match self.control.pid(&supervised).await {
            Ok(0) => {
                fleet_warn!(
                    context = LogContext::new()
                        .with_thing(&self.thing)
                        .with_job(&execution.job_id)
                        .with_program(&supervised),
                    "job program not running, restarting"
                );
                match self.control.restart(&supervised).await {
                    Ok(()) => self.transition(&supervised, "restart"),
                    Err(err) => {
                        self.transition(&supervised, "fail");
                        self.clear();
                        self.report(&execution, JobStatus::Failed, Some(err.to_string()))
                            .await;
                    }
                }
            }
            Ok(_) => fleet_debug!(
                context = LogContext::new()
                    .with_thing(&self.thing)
                    .with_job(&execution.job_id),
                "job already running"
            ),
            Err(err) => fleet_warn!(
                context = LogContext::new()
                    .with_thing(&self.thing)
                    .with_job(&execution.job_id)
                    .with_program(&supervised),
                "pid query failed: {}",
                err
            ),
        }
    }

    /// Per-job get accepted.
    async fn on_description(&mut self, execution: JobExecution) {
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|active| active.job_id == execution.job_id);
        if execution.status.is_terminal() {
            fleet_info!(
                context = LogContext::new()
                    .with_thing(&self.thing)
                    .with_job(&execution.job_id),
                "job reached {}",
                execution.status
            );
            if is_active && !self.stop().await {
                return;
            }
            self.request_snapshot().await;
        } else if is_active {
            if let Some(active) = self.active.as_mut() {
                active.status = execution.status;
                active.version_number = execution.version_number;
                active.execution_number = execution.execution_number;
            }
        } else {
            self.request_start_next().await;
        }
    }

    async fn on_description_rejected(&mut self, job_id: &str, message: &InboundMessage) {
        let body: RejectedResponse = message.json().unwrap_or_default();
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|active| active.job_id == job_id);
        if is_active && body.code_text() == TERMINAL_STATE_REACHED {
            if self.stop().await {
                self.request_snapshot().await;
            }
            return;
        }
        fleet_error!(
            context = LogContext::new().with_thing(&self.thing).with_job(job_id),
            "job description rejected: {} {}",
            body.code_text(),
            body.message.as_deref().unwrap_or("")
        );
    }

    async fn on_process_event(&mut self, message: &InboundMessage) {
        let event: ProcessStateEvent = match message.json() {
            Ok(event) => event,
            Err(err) => {
                fleet_warn!("malformed process event on {}: {}", message.topic, err);
                return;
            }
        };
        let program = if event.processname.is_empty() {
            topics::process_from_topic(&message.topic)
                .unwrap_or_default()
                .to_owned()
        } else {
            event.processname.clone()
        };
        if self.active_program().as_deref() != Some(program.as_str()) {
            fleet_debug!(
                context = LogContext::new().with_thing(&self.thing).with_program(&program),
                "{} for inactive program",
                event.eventname
            );
            return;
        }
        match event.state() {
            Some(ProcessState::Stopped | ProcessState::Exited) => {
                fleet_info!(
                    context = LogContext::new()
                        .with_thing(&self.thing)
                        .with_program(&program),
                    "job program ended ({})",
                    event.eventname
                );
                self.clear();
            }
            Some(ProcessState::Fatal) => {
                let Some(execution) = self.active.take() else {
                    return;
                };
                fleet_error!(
                    context = LogContext::new()
                        .with_thing(&self.thing)
                        .with_job(&execution.job_id)
                        .with_program(&program),
                    "job program failed permanently"
                );
                self.clear();
                self.transition(&program, "fail");
                self.report(
                    &execution,
                    JobStatus::Failed,
                    Some(format!("{program} entered FATAL state")),
                )
                .await;
            }
            _ => fleet_debug!(
                context = LogContext::new().with_thing(&self.thing).with_program(&program),
                "job program state changed: {}",
                event.eventname
            ),
        }
    }

    fn rejected(&self, message: &InboundMessage) {
        let body: RejectedResponse = message.json().unwrap_or_default();
        fleet_error!(
            context = LogContext::new().with_thing(&self.thing),
            "request rejected on {}: {} {}",
            message.topic,
            body.code_text(),
            body.message.as_deref().unwrap_or("")
        );
    }
}

fn valid_program(program: &str) -> bool {
    !program.is_empty()
        && program != "."
        && program != ".."
        && !program.contains(['/', '\\', '\0'])
}

fn execution_of(message: &InboundMessage) -> Option<JobExecution> {
    match message.json::<ExecutionEnvelope>() {
        Ok(envelope) => envelope.execution,
        Err(err) => {
            fleet_warn!("malformed execution on {}: {}", message.topic, err);
            None
        }
    }
}

#[async_trait]
impl Reconciler for JobReconciler {
    fn name(&self) -> &str {
        "jobs"
    }

    async fn on_connected(&mut self) -> r_fleet_msg::Result<()> {
        let mut filters = self.topics.subscriptions();
        filters.push(PROCESS_STATE_FILTER.to_owned());
        subscribe_all(
            self.transport.as_ref(),
            &filters,
            DeliveryGuarantee::AtLeastOnce,
            self.settings.ack_timeout,
        )
        .await?;
        self.transport
            .publish_empty(&self.topics.get(), DeliveryGuarantee::AtLeastOnce)
            .await
    }

    async fn on_message(&mut self, message: &InboundMessage) {
        if topics::process_from_topic(&message.topic).is_some() {
            self.on_process_event(message).await;
            return;
        }
        let Some(kind) = self.topics.classify(&message.topic) else {
            return;
        };
        match kind {
            JobTopic::GetAccepted => match message.json::<PendingJobs>() {
                Ok(pending) => self.on_snapshot(pending).await,
                Err(err) => fleet_warn!("malformed pending jobs snapshot: {}", err),
            },
            JobTopic::StartNextAccepted => match execution_of(message) {
                Some(execution) => self.on_execution(execution).await,
                None => fleet_debug!(
                    context = LogContext::new().with_thing(&self.thing),
                    "no pending execution"
                ),
            },
            JobTopic::DescribeAccepted(_) => {
                if let Some(execution) = execution_of(message) {
                    self.on_description(execution).await;
                }
            }
            JobTopic::DescribeRejected(job_id) => {
                self.on_description_rejected(&job_id, message).await
            }
            JobTopic::UpdateAccepted(job_id) => fleet_debug!(
                context = LogContext::new().with_thing(&self.thing).with_job(&job_id),
                "status update accepted"
            ),
            JobTopic::UpdateRejected(job_id) => {
                let body: RejectedResponse = message.json().unwrap_or_default();
                fleet_warn!(
                    context = LogContext::new().with_thing(&self.thing).with_job(&job_id),
                    "status update rejected: {} {}",
                    body.code_text(),
                    body.message.as_deref().unwrap_or("")
                );
            }
            JobTopic::GetRejected | JobTopic::StartNextRejected => self.rejected(message),
            JobTopic::Notify | JobTopic::NotifyNext => self.request_snapshot().await,
        }
    }

    fn heartbeat(&self) -> Option<Duration> {
        Some(self.settings.heartbeat)
    }

    async fn on_heartbeat(&mut self) {
        self.request_snapshot().await;
    }

    fn deadline(&self) -> Option<Instant> {
        self.step_deadline
    }

    async fn on_deadline(&mut self) {
        let Some(job_id) = self.active.as_ref().map(|active| active.job_id.clone()) else {
            self.step_deadline = None;
            return;
        };
        self.request(self.topics.describe(&job_id)).await;
        self.step_deadline = Some(Instant::now() + self.settings.step_timeout);
    }

    async fn on_shutdown(&mut self) {
        self.step_deadline = None;
        if let Some(active) = &self.active {
            fleet_debug!(
                context = LogContext::new()
                    .with_thing(&self.thing)
                    .with_job(&active.job_id),
                "job reconciler stopping with an active job"
            );
        }
    }
}

/// Execution payload as the jobs protocol sends it, for tests and tooling.
pub fn execution_payload(job_id: &str, program: &str, version: i64, execution: i64) -> Value {
    json!({
        "execution": {
            "jobId": job_id,
            "status": "IN_PROGRESS",
            "versionNumber": version,
            "executionNumber": execution,
            "jobDocument": { "program": program }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use r_fleet_msg::LoopbackTransport;
    use r_fleet_supervision::{ControlAction, RecordingControl};

    const BASE: &str = "$aws/things/thing-1/jobs";

    struct Harness {
        transport: Arc<LoopbackTransport>,
        control: RecordingControl,
        jobs: JobReconciler,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LoopbackTransport::connected());
        let control = RecordingControl::new();
        let jobs = JobReconciler::new(
            "thing-1",
            transport.clone(),
            Arc::new(control.clone()),
            JobDescriptorStore::new(dir.path()),
            JobSettings::default(),
        );
        Harness {
            transport,
            control,
            jobs,
            _dir: dir,
        }
    }

    impl Harness {
        async fn deliver(&mut self, topic: impl Into<String>, payload: Value) {
            self.jobs
                .on_message(&InboundMessage::new(topic, payload.to_string()))
                .await;
        }

        async fn snapshot(&mut self, in_progress: &[&str], queued: &[&str]) {
            let entries = |ids: &[&str]| -> Vec<Value> {
                ids.iter()
                    .map(|id| json!({"jobId": id, "versionNumber": 1, "executionNumber": 1}))
                    .collect()
            };
            self.deliver(
                format!("{BASE}/get/accepted"),
                json!({"inProgressJobs": entries(in_progress), "queuedJobs": entries(queued)}),
            )
            .await;
        }

        async fn start_next(&mut self, job: &str, program: &str) {
            self.deliver(
                format!("{BASE}/start-next/accepted"),
                execution_payload(job, program, 2, 1),
            )
            .await;
        }

        async fn process_event(&mut self, program: &str, state: &str) {
            self.deliver(
                topics::process_state(program),
                json!({
                    "eventname": format!("PROCESS_STATE_{state}"),
                    "processname": program,
                    "groupname": program,
                    "from_state": "RUNNING"
                }),
            )
            .await;
        }
    }

    #[tokio::test]
    async fn startup_subscribes_and_requests_snapshot() {
        let mut h = harness();
        h.jobs.on_connected().await.unwrap();

        let subscriptions = h.transport.active_subscriptions();
        assert_eq!(subscriptions.len(), 11);
        assert!(subscriptions.contains(&PROCESS_STATE_FILTER.to_owned()));
        assert_eq!(h.transport.published_to(&format!("{BASE}/get")).len(), 1);
    }

    #[tokio::test]
    async fn in_progress_snapshot_requests_start_next_once() {
        let mut h = harness();
        h.snapshot(&["J1"], &[]).await;

        assert_eq!(h.transport.published().len(), 1);
        assert_eq!(
            h.transport.published_to(&format!("{BASE}/start-next")).len(),
            1
        );
        assert!(h.control.calls().is_empty());
    }

    #[tokio::test]
    async fn start_next_starts_program_and_arms_step_timer() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;

        assert_eq!(h.control.calls_of(ControlAction::Start), vec!["jobs_sample1"]);
        assert_eq!(h.jobs.state(), JobState::Active);
        assert!(h.jobs.deadline().is_some());
        let descriptor: Value = JobDescriptorStore::new(h._dir.path())
            .read("sample1")
            .unwrap();
        assert_eq!(descriptor["jobId"], "J1");
    }

    #[tokio::test]
    async fn repeated_start_next_is_idempotent() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;
        h.control.clear();

        h.start_next("J1", "sample1").await;

        assert!(h.control.calls().is_empty());
        assert_eq!(h.jobs.active().unwrap().job_id, "J1");
    }

    #[tokio::test]
    async fn crashed_program_is_restarted_under_same_job() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;
        h.control.set_pid("jobs_sample1", 0);
        h.control.clear();

        h.start_next("J1", "sample1").await;

        assert_eq!(
            h.control.calls_of(ControlAction::Restart),
            vec!["jobs_sample1"]
        );
        assert!(h.control.calls_of(ControlAction::Start).is_empty());
        assert_eq!(h.jobs.active().unwrap().job_id, "J1");
    }

    #[tokio::test]
    async fn different_job_replaces_active_one() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;
        h.start_next("J2", "sample2").await;

        let calls = h.control.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].action, ControlAction::Stop);
        assert_eq!(calls[1].program, "jobs_sample1");
        assert_eq!(calls[2].action, ControlAction::Start);
        assert_eq!(calls[2].program, "jobs_sample2");
        assert_eq!(h.control.running(), vec!["jobs_sample2"]);
    }

    #[tokio::test]
    async fn failed_stop_keeps_active_job_and_skips_start() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;
        h.control.fail(ControlAction::Stop, Some("ERROR (spawn error)"));

        h.start_next("J2", "sample2").await;

        assert_eq!(h.jobs.active().unwrap().job_id, "J1");
        assert_eq!(h.jobs.state(), JobState::Active);
        assert!(!h
            .control
            .calls_of(ControlAction::Start)
            .contains(&"jobs_sample2".to_owned()));
    }

    #[tokio::test]
    async fn stop_of_exited_program_releases_job() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;
        h.control
            .fail(ControlAction::Stop, Some("jobs_sample1: ERROR (not running)"));
        h.control.set_pid("jobs_sample1", 0);
        h.transport.clear_published();

        h.snapshot(&[], &["J2"]).await;

        assert!(h.jobs.active().is_none());
        assert_eq!(h.jobs.state(), JobState::Idle);
        assert_eq!(
            h.transport.published_to(&format!("{BASE}/start-next")).len(),
            1
        );

        h.start_next("J2", "sample2").await;
        assert_eq!(
            h.control.calls_of(ControlAction::Start),
            vec!["jobs_sample1", "jobs_sample2"]
        );
        assert_eq!(h.jobs.active().unwrap().job_id, "J2");
    }

    #[tokio::test]
    async fn rejected_start_of_running_program_adopts_it() {
        let mut h = harness();
        h.control
            .fail(ControlAction::Start, Some("jobs_sample1: ERROR (already started)"));
        h.control.set_pid("jobs_sample1", 4242);

        h.start_next("J1", "sample1").await;

        assert!(h.transport.published_to(&format!("{BASE}/J1/update")).is_empty());
        assert_eq!(h.jobs.active().unwrap().job_id, "J1");
        assert_eq!(h.jobs.state(), JobState::Active);
        assert!(h.jobs.deadline().is_some());
    }

    #[tokio::test]
    async fn empty_snapshot_stops_active_job() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;
        h.transport.clear_published();

        h.snapshot(&[], &[]).await;

        assert_eq!(h.control.calls_of(ControlAction::Stop), vec!["jobs_sample1"]);
        assert!(h.jobs.active().is_none());
        assert!(h.transport.published().is_empty());
    }

    #[tokio::test]
    async fn queued_only_snapshot_requests_start_next() {
        let mut h = harness();
        h.snapshot(&[], &["J3"]).await;
        assert_eq!(
            h.transport.published_to(&format!("{BASE}/start-next")).len(),
            1
        );
    }

    #[tokio::test]
    async fn fatal_event_reports_failure_with_last_versions() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;

        h.process_event("jobs_sample1", "FATAL").await;

        assert!(h.jobs.active().is_none());
        assert!(h.jobs.deadline().is_none());
        let updates = h.transport.published_to(&format!("{BASE}/J1/update"));
        assert_eq!(updates.len(), 1);
        let body = updates[0].json();
        assert_eq!(body["status"], "FAILED");
        assert_eq!(body["expectedVersion"], 2);
        assert_eq!(body["executionNumber"], 1);
    }

    #[tokio::test]
    async fn exit_event_clears_without_report() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;
        h.transport.clear_published();

        h.process_event("jobs_other", "EXITED").await;
        assert!(h.jobs.active().is_some());

        h.process_event("jobs_sample1", "EXITED").await;
        assert!(h.jobs.active().is_none());
        assert!(h.transport.published().is_empty());
    }

    #[tokio::test]
    async fn unsafe_program_is_reported_failed() {
        let mut h = harness();
        h.start_next("J1", "../etc").await;

        assert!(h.control.calls().is_empty());
        assert_eq!(h.jobs.state(), JobState::Idle);
        let updates = h.transport.published_to(&format!("{BASE}/J1/update"));
        assert_eq!(updates[0].json()["status"], "FAILED");
    }

    #[tokio::test]
    async fn failed_start_is_reported() {
        let mut h = harness();
        h.control
            .fail(ControlAction::Start, Some("ERROR (no such process)"));

        h.start_next("J1", "sample1").await;

        assert!(h.jobs.active().is_none());
        let updates = h.transport.published_to(&format!("{BASE}/J1/update"));
        assert_eq!(updates.len(), 1);
        assert!(updates[0].json()["statusDetails"]["reason"]
            .as_str()
            .unwrap()
            .contains("no such process"));
    }

    #[tokio::test]
    async fn terminal_description_stops_and_refetches() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;
        let mut payload = execution_payload("J1", "sample1", 3, 1);
        payload["execution"]["status"] = json!("CANCELED");

        h.deliver(format!("{BASE}/J1/get/accepted"), payload).await;

        assert_eq!(h.control.calls_of(ControlAction::Stop), vec!["jobs_sample1"]);
        assert_eq!(h.transport.published_to(&format!("{BASE}/get")).len(), 1);
    }

    #[tokio::test]
    async fn terminal_state_rejection_stops_active_job() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;

        h.deliver(
            format!("{BASE}/J1/get/rejected"),
            json!({"code": "TerminalStateReached", "message": "done"}),
        )
        .await;

        assert!(h.jobs.active().is_none());
        assert_eq!(h.transport.published_to(&format!("{BASE}/get")).len(), 1);
    }

    #[tokio::test]
    async fn notifications_only_refetch() {
        let mut h = harness();
        h.deliver(format!("{BASE}/notify"), json!({"jobs": {}})).await;
        h.deliver(
            format!("{BASE}/notify-next"),
            execution_payload("J9", "sample9", 1, 1),
        )
        .await;

        assert!(h.control.calls().is_empty());
        assert_eq!(h.transport.published_to(&format!("{BASE}/get")).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn step_deadline_polls_active_execution() {
        let mut h = harness();
        h.start_next("J1", "sample1").await;
        let deadline = h.jobs.deadline().unwrap();
        assert_eq!(deadline - Instant::now(), Duration::from_secs(60));

        tokio::time::sleep_until(deadline).await;
        h.jobs.on_deadline().await;

        assert_eq!(h.transport.published_to(&format!("{BASE}/J1/get")).len(), 1);
        assert!(h.jobs.deadline().unwrap() > deadline);
    }

    #[derive(Debug, Clone)]
    enum Event {
        Snapshot { in_progress: Option<u8>, queued: bool },
        StartNext(u8),
        Terminal(u8),
        Exited(u8),
        Fatal(u8),
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            (proptest::option::of(0u8..4), any::<bool>())
                .prop_map(|(in_progress, queued)| Event::Snapshot { in_progress, queued }),
            (0u8..4).prop_map(Event::StartNext),
            (0u8..4).prop_map(Event::Terminal),
            (0u8..4).prop_map(Event::Exited),
            (0u8..4).prop_map(Event::Fatal),
        ]
    }

    proptest! {
        #[test]
        fn at_most_one_program_runs(events in proptest::collection::vec(event(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let mut h = harness();
                for event in events {
                    match event {
                        Event::Snapshot { in_progress, queued } => {
                            let in_progress: Vec<String> =
                                in_progress.iter().map(|n| format!("J{n}")).collect();
                            let in_progress: Vec<&str> =
                                in_progress.iter().map(String::as_str).collect();
                            let queued: &[&str] = if queued { &["Jq"] } else { &[] };
                            h.snapshot(&in_progress, queued).await;
                        }
                        Event::StartNext(n) => {
                            h.start_next(&format!("J{n}"), &format!("sample{n}")).await
                        }
                        Event::Terminal(n) => {
                            let mut payload =
                                execution_payload(&format!("J{n}"), &format!("sample{n}"), 5, 1);
                            payload["execution"]["status"] = json!("SUCCEEDED");
                            h.deliver(format!("{BASE}/J{n}/get/accepted"), payload).await;
                        }
                        Event::Exited(n) | Event::Fatal(n) => {
                            let program = format!("jobs_sample{n}");
                            let state = if matches!(event, Event::Exited(_)) { "EXITED" } else { "FATAL" };
                            h.control.set_pid(&program, 0);
                            h.process_event(&program, state).await;
                        }
                    }
                    let running = h.control.running();
                    assert!(running.len() <= 1, "running: {running:?}");
                    if let Some(program) = h.jobs.active_program() {
                        assert_eq!(running, vec![program]);
                    }
                }
            });
        }
    }
}
