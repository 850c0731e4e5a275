//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Job status reporting on behalf of a supervised program."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use r_fleet_common::config::AppConfig;
use r_fleet_msg::topics::JobTopics;
use r_fleet_msg::types::{JobExecution, JobStatus, JobUpdateRequest};
use r_fleet_msg::{
    connect_and_wait, Correlator, MqttTransport, RumqttSettings, RumqttTransport, TlsCredentials,
};
use r_fleet_persistence::{IdentityStore, JobDescriptorStore};
use serde_json::{json, Map, Value};
use tokio::runtime::Runtime;

/// Job commands.
#[derive(Debug, Subcommand)]
pub enum JobCommand {
    /// Report the final status of the execution handed to a program.
    Report(ReportOptions),
}

#[derive(Debug, Args)]
pub struct ReportOptions {
    /// Program name the job document referred to.
    #[arg(long)]
    pub program: String,
    #[arg(long, value_enum)]
    pub status: ReportStatus,
    /// Reason recorded in the status details.
    #[arg(long)]
    pub reason: Option<String>,
    /// Print the update instead of publishing it.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Succeeded,
    Failed,
}

impl From<ReportStatus> for JobStatus {
    fn from(status: ReportStatus) -> Self {
        match status {
            ReportStatus::Succeeded => JobStatus::Succeeded,
            ReportStatus::Failed => JobStatus::Failed,
        }
    }
}

pub fn run(command: JobCommand, config: &AppConfig) -> Result<()> {
    match command {
        JobCommand::Report(options) => report(&options, config),
    }
}

fn report(options: &ReportOptions, config: &AppConfig) -> Result<()> {
    let store = JobDescriptorStore::new(&config.jobs.descriptor_dir);
    let execution: JobExecution = store.read(&options.program).with_context(|| {
        format!(
            "no job descriptor for program '{}' in {}",
            options.program,
            store.root().display()
        )
    })?;
    let thing = thing_for(&execution, config)?;
    let topic = JobTopics::new(&thing).update(&execution.job_id);
    let request = update_request(&execution, options);

    if options.dry_run {
        println!("{}", topic);
        println!("{}", serde_json::to_string_pretty(&request)?);
        return Ok(());
    }

    let runtime = Runtime::new()?;
    let accepted = runtime.block_on(publish_update(config, &thing, &options.program, &topic, &request))?;
    println!(
        "Job {} reported {} (accepted at {})",
        execution.job_id,
        request.status,
        accepted.get("timestamp").cloned().unwrap_or(Value::Null)
    );
    Ok(())
}

fn update_request(execution: &JobExecution, options: &ReportOptions) -> JobUpdateRequest {
    let status_details = options.reason.as_ref().map(|reason| {
        let mut details = Map::new();
        details.insert("reason".to_owned(), json!(reason));
        details
    });
    JobUpdateRequest {
        status: options.status.into(),
        expected_version: execution.version_number,
        execution_number: execution.execution_number,
        status_details,
    }
}

fn thing_for(execution: &JobExecution, config: &AppConfig) -> Result<String> {
    if let Some(thing) = execution.extra.get("thingName").and_then(Value::as_str) {
        return Ok(thing.to_owned());
    }
    if let Some(thing) = config.thing_name_override() {
        return Ok(thing);
    }
    let identity = IdentityStore::new(&config.identity.directory)
        .load()
        .context("descriptor names no thing and no identity is provisioned")?;
    Ok(identity.thing_name)
}

async fn publish_update(
    config: &AppConfig,
    thing: &str,
    program: &str,
    topic: &str,
    request: &JobUpdateRequest,
) -> Result<Value> {
    // the agent holds the thing's own client id
    let client_id = format!("{}-{}", thing, program);
    let mut settings = RumqttSettings::new(client_id, &config.broker.host, config.broker.port);
    settings.keep_alive = config.broker.keep_alive;
    settings.capacity = config.broker.channel_capacity;
    if let Some(tls) = &config.broker.tls {
        settings = settings.with_tls(
            TlsCredentials::from_files(&tls.root_ca, &tls.certificate, &tls.private_key)
                .context("failed to read broker TLS material")?,
        );
    }
    let transport: Arc<dyn MqttTransport> = Arc::new(RumqttTransport::spawn(settings, None));
    connect_and_wait(transport.as_ref(), config.broker.connect_timeout)
        .await
        .context("broker unreachable")?;

    let correlator = Correlator::new(transport.clone()).with_ack_timeout(config.broker.ack_timeout);
    let outcome = correlator
        .call_accepted(topic, serde_json::to_value(request)?, config.correlator.timeout)
        .await;
    let _ = transport.disconnect().await;
    match outcome {
        Ok(accepted) => Ok(accepted),
        Err(r_fleet_msg::MessagingError::Rejected { payload, .. }) => {
            bail!("job update rejected: {}", payload)
        }
        Err(err) => Err(err).context("job update not confirmed"),
    }
}
