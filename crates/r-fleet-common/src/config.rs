//! ---
//! fleet_section: "04-configuration-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Agent configuration model and loader."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_app_name() -> String {
    "r-fleet".to_owned()
}

fn default_topic_prefix() -> String {
    "r-fleet".to_owned()
}

fn default_broker_host() -> String {
    "localhost".to_owned()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_channel_capacity() -> usize {
    64
}

fn default_identity_directory() -> PathBuf {
    PathBuf::from("/mnt/r-fleet/aws")
}

fn default_endpoint_file() -> PathBuf {
    PathBuf::from("/etc/r-fleet/aws/endpoint")
}

fn default_provisioning_port() -> u16 {
    8883
}

fn default_root_ca() -> PathBuf {
    PathBuf::from("/etc/r-fleet/aws/root.crt")
}

fn default_bootstrap_certificate() -> PathBuf {
    PathBuf::from("/etc/r-fleet/aws/client.crt")
}

fn default_bootstrap_private_key() -> PathBuf {
    PathBuf::from("/etc/r-fleet/aws/client.key")
}

fn default_country() -> String {
    "US".to_owned()
}

fn default_correlator_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_true() -> bool {
    true
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(600)
}

fn default_program_prefix() -> String {
    "jobs_".to_owned()
}

fn default_descriptor_dir() -> PathBuf {
    PathBuf::from("/tmp/r-fleet/jobs")
}

fn default_supervisorctl() -> PathBuf {
    PathBuf::from("supervisorctl")
}

fn default_supervisor_config() -> PathBuf {
    PathBuf::from("/etc/r-fleet/supervisord.conf")
}

fn default_shadow_names() -> Vec<String> {
    vec!["sample".to_owned()]
}

fn default_shadow_cache_dir() -> PathBuf {
    PathBuf::from("/tmp/r-fleet/shadows")
}

fn default_tunnel_config_dir() -> PathBuf {
    PathBuf::from("/tmp/r-fleet/localproxy")
}

fn default_tunnel_program() -> String {
    "ssh".to_owned()
}

fn default_presence_shadow() -> String {
    "sample".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("/var/log/r-fleet")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_forward_level() -> String {
    "info".to_owned()
}

fn default_forward_capacity() -> usize {
    256
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9899))
}

/// Primary configuration object for the R-Fleet agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Explicit thing name; normally read from the provisioned identity.
    #[serde(default)]
    pub thing_name: Option<String>,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub shadows: ShadowsConfig,
    #[serde(default)]
    pub tunnels: TunnelsConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_FLEET_CONFIG";
    pub const ENV_CLIENT_ID: &str = "R_FLEET_CLIENT_ID";

    /// Default search locations used by the binaries.
    pub fn default_candidates() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/etc/r-fleet/agent.toml"),
            PathBuf::from("configs/agent.toml"),
        ]
    }

    /// Load configuration from disk, respecting the `R_FLEET_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Thing name override from the environment or the config file.
    pub fn thing_name_override(&self) -> Option<String> {
        std::env::var(Self::ENV_CLIENT_ID)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.thing_name.clone())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(anyhow!("app_name must not be empty"));
        }
        ensure_topic_level("topic_prefix", &self.topic_prefix)?;
        if let Some(thing) = &self.thing_name {
            ensure_topic_level("thing_name", thing)?;
        }
        if self.broker.ack_timeout.is_zero() || self.broker.connect_timeout.is_zero() {
            return Err(anyhow!("broker timeouts must be greater than zero"));
        }
        if self.broker.channel_capacity == 0 {
            return Err(anyhow!("broker.channel_capacity must be greater than zero"));
        }
        if self.correlator.timeout.is_zero() {
            return Err(anyhow!("correlator.timeout must be greater than zero"));
        }
        self.jobs.validate()?;
        self.shadows.validate()?;
        if self.presence.enabled {
            ensure_topic_level("presence.shadow", &self.presence.shadow)?;
        }
        Ok(())
    }
}

fn ensure_topic_level(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(anyhow!("{} must not be empty", field));
    }
    if value.contains(['/', '+', '#']) {
        return Err(anyhow!(
            "{} '{}' must be a single topic level without wildcards",
            field,
            value
        ));
    }
    Ok(())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            topic_prefix: default_topic_prefix(),
            thing_name: None,
            broker: BrokerConfig::default(),
            identity: IdentityConfig::default(),
            provisioning: ProvisioningConfig::default(),
            correlator: CorrelatorConfig::default(),
            supervisor: SupervisorConfig::default(),
            jobs: JobsConfig::default(),
            shadows: ShadowsConfig::default(),
            tunnels: TunnelsConfig::default(),
            presence: PresenceConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Connection to the broker used during normal operation.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default = "default_ack_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub ack_timeout: Duration,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// TLS material; plain TCP to a local bridge when absent.
    #[serde(default)]
    pub tls: Option<TlsFiles>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            ack_timeout: default_ack_timeout(),
            channel_capacity: default_channel_capacity(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsFiles {
    pub root_ca: PathBuf,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_directory")]
    pub directory: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            directory: default_identity_directory(),
        }
    }
}

/// Settings for the two-phase certificate exchange.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Broker endpoint; read from `endpoint_file` when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_endpoint_file")]
    pub endpoint_file: PathBuf,
    #[serde(default = "default_provisioning_port")]
    pub port: u16,
    #[serde(default = "default_root_ca")]
    pub root_ca: PathBuf,
    #[serde(default = "default_bootstrap_certificate")]
    pub bootstrap_certificate: PathBuf,
    #[serde(default = "default_bootstrap_private_key")]
    pub bootstrap_private_key: PathBuf,
    #[serde(default = "default_correlator_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_country")]
    pub country: String,
    /// CSR common name; defaults to `app_name`.
    #[serde(default)]
    pub common_name: Option<String>,
}

impl ProvisioningConfig {
    /// Resolve the broker endpoint from config or the endpoint file.
    pub fn resolve_endpoint(&self) -> Result<String> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.trim().to_owned());
        }
        let raw = fs::read_to_string(&self.endpoint_file).with_context(|| {
            format!(
                "unable to read endpoint file {}",
                self.endpoint_file.display()
            )
        })?;
        let endpoint = raw.trim();
        if endpoint.is_empty() {
            return Err(anyhow!(
                "endpoint file {} is empty",
                self.endpoint_file.display()
            ));
        }
        Ok(endpoint.to_owned())
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            endpoint_file: default_endpoint_file(),
            port: default_provisioning_port(),
            root_ca: default_root_ca(),
            bootstrap_certificate: default_bootstrap_certificate(),
            bootstrap_private_key: default_bootstrap_private_key(),
            timeout: default_correlator_timeout(),
            country: default_country(),
            common_name: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    #[serde(default = "default_correlator_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            timeout: default_correlator_timeout(),
        }
    }
}

/// Location of the process supervisor's control CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisorctl")]
    pub command: PathBuf,
    #[serde(default = "default_supervisor_config")]
    pub config_file: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: default_supervisorctl(),
            config_file: default_supervisor_config(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_step_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub step_timeout: Duration,
    #[serde(default = "default_heartbeat")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat: Duration,
    /// Prefix applied to a job's program name to form the supervised program.
    #[serde(default = "default_program_prefix")]
    pub program_prefix: String,
    #[serde(default = "default_descriptor_dir")]
    pub descriptor_dir: PathBuf,
}

impl JobsConfig {
    fn validate(&self) -> Result<()> {
        if self.step_timeout.is_zero() || self.heartbeat.is_zero() {
            return Err(anyhow!("jobs timers must be greater than zero"));
        }
        if self.program_prefix.contains(['/', '\\']) {
            return Err(anyhow!(
                "jobs.program_prefix '{}' must not contain path separators",
                self.program_prefix
            ));
        }
        Ok(())
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            step_timeout: default_step_timeout(),
            heartbeat: default_heartbeat(),
            program_prefix: default_program_prefix(),
            descriptor_dir: default_descriptor_dir(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowsConfig {
    #[serde(default = "default_shadow_names")]
    pub names: Vec<String>,
    #[serde(default = "default_heartbeat")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat: Duration,
    #[serde(default = "default_shadow_cache_dir")]
    pub cache_dir: PathBuf,
}

impl ShadowsConfig {
    fn validate(&self) -> Result<()> {
        if self.heartbeat.is_zero() {
            return Err(anyhow!("shadows.heartbeat must be greater than zero"));
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.names {
            ensure_topic_level("shadow name", name)?;
            if !seen.insert(name.as_str()) {
                return Err(anyhow!("shadow '{}' declared more than once", name));
            }
        }
        Ok(())
    }
}

impl Default for ShadowsConfig {
    fn default() -> Self {
        Self {
            names: default_shadow_names(),
            heartbeat: default_heartbeat(),
            cache_dir: default_shadow_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tunnel_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_tunnel_program")]
    pub program: String,
}

impl Default for TunnelsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config_dir: default_tunnel_config_dir(),
            program: default_tunnel_program(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_presence_shadow")]
    pub shadow: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shadow: default_presence_shadow(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Publish log records to the broker's log topic.
    #[serde(default = "default_true")]
    pub forward: bool,
    #[serde(default = "default_forward_level")]
    pub forward_level: String,
    #[serde(default = "default_forward_capacity")]
    pub forward_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            forward: true,
            forward_level: default_forward_level(),
            forward_capacity: default_forward_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
