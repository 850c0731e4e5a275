//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Local agent state: job descriptors, shadow cache, identity."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
#![warn(missing_docs)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing state files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A name used as a file name is empty or escapes its directory.
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    /// No provisioned identity exists at the given location.
    #[error("no identity at {0}")]
    MissingIdentity(PathBuf),
}

pub mod descriptors;
pub mod identity;
pub mod shadows;

pub use descriptors::JobDescriptorStore;
pub use identity::{IdentityStore, StoredIdentity};
pub use shadows::ShadowCache;

/// Reject names that could leave the directory they are joined to.
pub fn ensure_file_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(PersistenceError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Write `bytes` to a sibling temporary file, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));
    {
        let mut file = fs::File::create(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(err.into());
    }
    Ok(())
}
