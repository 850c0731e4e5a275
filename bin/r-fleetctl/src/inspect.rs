//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Read-only views of cached shadows and the stored identity."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use anyhow::{bail, Context, Result};
use clap::Subcommand;
use r_fleet_common::config::AppConfig;
use r_fleet_persistence::{IdentityStore, ShadowCache};
use serde_json::Value;

#[derive(Debug, Subcommand)]
pub enum ShadowCommand {
    /// Print the last desired state seen for a shadow.
    Show {
        #[arg(default_value = "sample")]
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum IdentityCommand {
    /// Print the thing name, certificate id and fingerprint.
    Show,
}

pub fn run_shadow(command: ShadowCommand, config: &AppConfig) -> Result<()> {
    match command {
        ShadowCommand::Show { name } => {
            let cache = ShadowCache::new(&config.shadows.cache_dir);
            let Some(desired) = cache
                .read(&name)
                .with_context(|| format!("failed to read shadow cache for '{}'", name))?
            else {
                bail!("no cached state for shadow '{}'", name);
            };
            println!("{}", serde_json::to_string_pretty(&Value::Object(desired))?);
        }
    }
    Ok(())
}

pub fn run_identity(command: IdentityCommand, config: &AppConfig) -> Result<()> {
    match command {
        IdentityCommand::Show => {
            let store = IdentityStore::new(&config.identity.directory);
            let identity = store.load().with_context(|| {
                format!(
                    "no provisioned identity in {}",
                    config.identity.directory.display()
                )
            })?;
            println!("Thing: {}", identity.thing_name);
            println!("Certificate: {}", identity.certificate_id);
            println!("Fingerprint: {}", identity.fingerprint());
        }
    }
    Ok(())
}
