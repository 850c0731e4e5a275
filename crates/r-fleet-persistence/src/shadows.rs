//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Last known desired state per shadow."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{ensure_file_name, write_atomic, Result};

/// Cache of the desired section of each named shadow, one file per shadow.
#[derive(Debug, Clone)]
pub struct ShadowCache {
    root: PathBuf,
}

impl ShadowCache {
    /// Cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the cache files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        ensure_file_name(name)?;
        Ok(self.root.join(name))
    }

    /// Replace the cached desired state of `name`.
    pub fn write(&self, name: &str, desired: &Map<String, Value>) -> Result<()> {
        let path = self.path(name)?;
        write_atomic(&path, &serde_json::to_vec(desired)?)?;
        debug!(shadow = name, keys = desired.len(), "shadow cache updated");
        Ok(())
    }

    /// Cached desired state of `name`, `None` when nothing is cached.
    pub fn read(&self, name: &str) -> Result<Option<Map<String, Value>>> {
        let path = self.path(name)?;
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Drop the cache entry of `name`; returns whether one existed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path(name)?;
        match fs::remove_file(path) {
            Ok(()) => {
                info!(shadow = name, "shadow cache deleted");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
