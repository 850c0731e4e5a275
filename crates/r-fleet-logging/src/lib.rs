//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Structured logging context shared by reconcilers."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for CLIs and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Thing name the agent runs as.
    pub thing: Option<&'a str>,
    /// Job identifier the event relates to.
    pub job: Option<&'a str>,
    /// Named shadow the event relates to.
    pub shadow: Option<&'a str>,
    /// Supervised program name.
    pub program: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a thing name.
    pub fn with_thing(mut self, thing: &'a str) -> Self {
        self.thing = Some(thing);
        self
    }

    /// Attach a job identifier.
    pub fn with_job(mut self, job: &'a str) -> Self {
        self.job = Some(job);
        self
    }

    /// Attach a shadow name.
    pub fn with_shadow(mut self, shadow: &'a str) -> Self {
        self.shadow = Some(shadow);
        self
    }

    /// Attach a supervised program name.
    pub fn with_program(mut self, program: &'a str) -> Self {
        self.program = Some(program);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized system event with a success/fault outcome.
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    match outcome {
        SystemEventOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            thing = ctx.thing.unwrap_or(""),
            job = ctx.job.unwrap_or(""),
            shadow = ctx.shadow.unwrap_or(""),
            program = ctx.program.unwrap_or(""),
            message = %message
        ),
        SystemEventOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            thing = ctx.thing.unwrap_or(""),
            job = ctx.job.unwrap_or(""),
            shadow = ctx.shadow.unwrap_or(""),
            program = ctx.program.unwrap_or(""),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new().with_thing("thing-a").with_job("job-1");
        fleet_info!(context = ctx.clone(), "job started");
        fleet_debug!("debug message");
        fleet_debug!(
            context = ctx.clone().with_program("jobs_sample"),
            "{} for inactive program",
            "PROCESS_STATE_EXITED"
        );
        fleet_warn!(context = ctx.clone().with_program("jobs_sample"), "stale timer");
        fleet_error!(context = ctx, "update rejected: {}", "VersionMismatch");
    }

    #[test]
    fn context_builder_sets_fields() {
        let ctx = LogContext::new()
            .with_shadow("sample")
            .with_program("jobs_sample");
        assert_eq!(ctx.shadow, Some("sample"));
        assert_eq!(ctx.program, Some("jobs_sample"));
        assert!(ctx.thing.is_none());
    }

    #[test]
    fn system_event_helper_emits() {
        init();
        let ctx = LogContext::new().with_thing("thing-a");
        log_system_event(
            Some(&ctx),
            "agent.start",
            "agent started",
            SystemEventOutcome::Success,
        );
        log_system_event(
            None,
            "agent.start",
            "identity missing",
            SystemEventOutcome::Fault,
        );
    }
}
