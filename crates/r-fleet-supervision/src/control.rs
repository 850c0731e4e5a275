//! ---
//! fleet_section: "07-resilience-fault-tolerance"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Control plane commands: start, stop, restart, pid."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strum::{Display, EnumString};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{Result, SupervisionError};

/// Commands understood by the supervision control plane.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Start `program`.
    async fn start(&self, program: &str) -> Result<()>;
    /// Stop `program`.
    async fn stop(&self, program: &str) -> Result<()>;
    /// Restart `program`.
    async fn restart(&self, program: &str) -> Result<()>;
    /// Process id of `program`, `0` when it is not running.
    async fn pid(&self, program: &str) -> Result<u32>;
}

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ProcessControl`] backed by the `supervisorctl` command line client.
#[derive(Debug, Clone)]
pub struct SupervisorCtl {
    command: PathBuf,
    config_file: PathBuf,
    timeout: Duration,
}

impl SupervisorCtl {
    /// Control client running `command -c config_file ...`.
    pub fn new(command: impl Into<PathBuf>, config_file: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            config_file: config_file.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Upper bound for a single control command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, verb: &'static str, program: &str) -> Result<(bool, String)> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-c")
            .arg(&self.config_file)
            .arg(verb)
            .arg(program)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %self.command.display(), verb, program, "invoking supervisor");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SupervisionError::Command {
                verb,
                program: program.to_owned(),
                output: format!("timed out after {:?}", self.timeout),
            })??;

        let mut text = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr.trim());
        }
        Ok((output.status.success(), text))
    }

    async fn command(&self, verb: &'static str, program: &str) -> Result<()> {
        let (success, output) = self.run(verb, program).await?;
        if already_settled(verb, &output) {
            info!(verb, program, %output, "program already in requested state");
            return Ok(());
        }
        // supervisorctl 3.x exits 0 even when the action failed
        if !success || output.contains("ERROR") {
            return Err(SupervisionError::Command {
                verb,
                program: program.to_owned(),
                output,
            });
        }
        info!(verb, program, "supervisor command applied");
        Ok(())
    }
}

#[async_trait]
impl ProcessControl for SupervisorCtl {
    async fn start(&self, program: &str) -> Result<()> {
        self.command("start", program).await
    }

    async fn stop(&self, program: &str) -> Result<()> {
        self.command("stop", program).await
    }

    async fn restart(&self, program: &str) -> Result<()> {
        self.command("restart", program).await
    }

    async fn pid(&self, program: &str) -> Result<u32> {
        // a stopped program prints 0 with a non-zero exit status, so the
        // output decides, not the status
        let (_, output) = self.run("pid", program).await?;
        parse_pid(program, &output)
    }
}

/// Whether a rejected verb left the program where the caller wanted it:
/// starting a running program or stopping one that already exited.
fn already_settled(verb: &str, output: &str) -> bool {
    match verb {
        "start" => output.contains("ERROR (already started)"),
        "stop" => output.contains("ERROR (not running)"),
        _ => false,
    }
}

fn parse_pid(program: &str, output: &str) -> Result<u32> {
    output
        .lines()
        .next()
        .map(str::trim)
        .and_then(|line| line.parse::<u32>().ok())
        .ok_or_else(|| SupervisionError::InvalidPid {
            program: program.to_owned(),
            output: output.to_owned(),
        })
}

/// Control verb recorded by [`RecordingControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ControlAction {
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `restart`
    Restart,
}

/// One control command issued against [`RecordingControl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCall {
    /// Verb.
    pub action: ControlAction,
    /// Supervised program name.
    pub program: String,
}

#[derive(Default)]
struct RecordingState {
    calls: Vec<ControlCall>,
    pids: HashMap<String, u32>,
    failing: HashMap<ControlAction, String>,
    next_pid: u32,
}

/// In-memory control plane that records every command.
///
/// Started programs get a fresh non-zero pid, stopped programs report `0`.
/// Individual verbs can be made to fail, and pids can be overridden to
/// simulate a crash behind the supervisor's back.
#[derive(Clone, Default)]
pub struct RecordingControl {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingControl {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands received so far.
    pub fn calls(&self) -> Vec<ControlCall> {
        self.state.lock().calls.clone()
    }

    /// Commands of one verb received so far, as program names.
    pub fn calls_of(&self, action: ControlAction) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.action == action)
            .map(|call| call.program.clone())
            .collect()
    }

    /// Forget recorded commands; pids are kept.
    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }

    /// Override the pid reported for `program`.
    pub fn set_pid(&self, program: &str, pid: u32) {
        self.state.lock().pids.insert(program.to_owned(), pid);
    }

    /// Programs currently reported as running, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self
            .state
            .lock()
            .pids
            .iter()
            .filter(|(_, pid)| **pid != 0)
            .map(|(program, _)| program.clone())
            .collect();
        running.sort();
        running
    }

    /// Make every `action` command fail with `output` until cleared with `None`.
    pub fn fail(&self, action: ControlAction, output: Option<&str>) {
        let mut state = self.state.lock();
        match output {
            Some(output) => {
                state.failing.insert(action, output.to_owned());
            }
            None => {
                state.failing.remove(&action);
            }
        }
    }

    fn apply(&self, action: ControlAction, program: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ControlCall {
            action,
            program: program.to_owned(),
        });
        if let Some(output) = state.failing.get(&action) {
            return Err(SupervisionError::Command {
                verb: match action {
                    ControlAction::Start => "start",
                    ControlAction::Stop => "stop",
                    ControlAction::Restart => "restart",
                },
                program: program.to_owned(),
                output: output.clone(),
            });
        }
        let pid = match action {
            ControlAction::Stop => 0,
            ControlAction::Start | ControlAction::Restart => {
                state.next_pid += 1;
                1000 + state.next_pid
            }
        };
        state.pids.insert(program.to_owned(), pid);
        Ok(())
    }
}

#[async_trait]
impl ProcessControl for RecordingControl {
    async fn start(&self, program: &str) -> Result<()> {
        self.apply(ControlAction::Start, program)
    }

    async fn stop(&self, program: &str) -> Result<()> {
        self.apply(ControlAction::Stop, program)
    }

    async fn restart(&self, program: &str) -> Result<()> {
        self.apply(ControlAction::Restart, program)
    }

    async fn pid(&self, program: &str) -> Result<u32> {
        Ok(self.state.lock().pids.get(program).copied().unwrap_or(0))
    }
}
