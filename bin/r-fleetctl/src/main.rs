//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "binary"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Control CLI for supervised job programs and operators."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use r_fleet_common::config::AppConfig;
use r_fleet_logging as logging;

mod inspect;
mod job;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "R-Fleet device control utility",
    long_about = None
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(subcommand, about = "Actions taken by a supervised job program")]
    Job(job::JobCommand),
    #[command(subcommand, about = "Inspect cached shadow state")]
    Shadow(inspect::ShadowCommand),
    #[command(subcommand, about = "Inspect the provisioned identity")]
    Identity(inspect::IdentityCommand),
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Job(cmd) => job::run(cmd, &config)?,
        Commands::Shadow(cmd) => inspect::run_shadow(cmd, &config)?,
        Commands::Identity(cmd) => inspect::run_identity(cmd, &config)?,
    }
    Ok(())
}

fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.extend(AppConfig::default_candidates());
    AppConfig::load(&candidates)
}
