//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Job execution descriptors handed to job programs."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! A job program learns which execution it serves from the descriptor the
//! agent writes, under the program's name, before asking the supervisor to
//! start it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{ensure_file_name, write_atomic, Result};

/// Directory of per-program execution descriptors.
#[derive(Debug, Clone)]
pub struct JobDescriptorStore {
    root: PathBuf,
}

impl JobDescriptorStore {
    /// Store rooted at `root`; the directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the descriptors.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the descriptor of `program`.
    pub fn path(&self, program: &str) -> Result<PathBuf> {
        ensure_file_name(program)?;
        Ok(self.root.join(program))
    }

    /// Write the descriptor of `program`, replacing any previous one.
    pub fn write<T: Serialize + ?Sized>(&self, program: &str, descriptor: &T) -> Result<PathBuf> {
        let path = self.path(program)?;
        let bytes = serde_json::to_vec(descriptor)?;
        write_atomic(&path, &bytes)?;
        debug!(program, path = %path.display(), "job descriptor written");
        Ok(path)
    }

    /// Read the descriptor of `program`.
    pub fn read<T: DeserializeOwned>(&self, program: &str) -> Result<T> {
        let path = self.path(program)?;
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Remove the descriptor of `program`; returns whether one existed.
    pub fn remove(&self, program: &str) -> Result<bool> {
        let path = self.path(program)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PersistenceError;
    use serde_json::{json, Value};

    #[test]
    fn descriptor_is_written_under_program_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobDescriptorStore::new(dir.path().join("jobs"));
        let execution = json!({"jobId": "J1", "versionNumber": 1, "executionNumber": 7});
        let path = store.write("sample1", &execution).unwrap();
        assert_eq!(path, dir.path().join("jobs").join("sample1"));

        let read: Value = store.read("sample1").unwrap();
        assert_eq!(read, execution);
        assert!(store.remove("sample1").unwrap());
        assert!(!store.remove("sample1").unwrap());
    }

    #[test]
    fn unsafe_program_names_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobDescriptorStore::new(dir.path());
        assert!(matches!(
            store.write("../escape", &json!({})),
            Err(PersistenceError::InvalidName(_))
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
