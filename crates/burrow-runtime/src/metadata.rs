//! Container metadata store.
//!
//! One JSON record per container at `<containers>/<name>/config.json`.
//! The directory is keyed by name, so linking the record file into
//! place (which refuses an existing target) is what makes names unique
//! among live containers.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use burrow_common::constants::{LOG_FILE, RECORD_FILE};
use burrow_common::error::BurrowError;
use burrow_common::types::{ContainerId, ContainerStatus, PortMapping, VolumeSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the metadata store.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// A record with this name already exists.
    #[error("container name already in use: {name}")]
    DuplicateName {
        /// Conflicting name.
        name: String,
    },

    /// No record with this name exists.
    #[error("container not found: {name}")]
    NotFound {
        /// Requested name.
        name: String,
    },

    /// Common error from the shared layer.
    #[error(transparent)]
    Common(#[from] BurrowError),
}

impl From<serde_json::Error> for MetadataError {
    fn from(source: serde_json::Error) -> Self {
        Self::Common(BurrowError::from(source))
    }
}

type Result<T> = std::result::Result<T, MetadataError>;

/// Persistent record of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Generated identifier.
    pub id: ContainerId,
    /// Unique name; defaults to the id.
    pub name: String,
    /// Host pid of the init process while it runs.
    pub pid: Option<u32>,
    /// Command line as given by the user.
    pub command: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// Requested port forwards.
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    /// Image the container was started from.
    #[serde(default)]
    pub image: String,
    /// Volume bind, if any.
    #[serde(default)]
    pub volume: Option<VolumeSpec>,
    /// Network the container was attached to, if any.
    #[serde(default)]
    pub network: Option<String>,
    /// Address on that network.
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
}

/// File-backed store of [`ContainerRecord`]s.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    /// Creates a store rooted at `dir` (normally `<root>/containers`).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding everything kept for container `name`.
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Log file of a detached container.
    #[must_use]
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(LOG_FILE)
    }

    /// Claims the directory of `name` ahead of a launch, so a detached
    /// container's log is never written into another container's
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if the directory already exists.
    pub fn reserve(&self, name: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(BurrowError::io(&self.dir))?;
        let dir = self.container_dir(name);
        match std::fs::create_dir(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(MetadataError::DuplicateName {
                name: name.to_string(),
            }),
            Err(e) => Err(BurrowError::io(&dir)(e).into()),
        }
    }

    /// Persists a new record.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if a record with the same name exists.
    pub fn record(&self, record: &ContainerRecord) -> Result<()> {
        let dir = self.container_dir(&record.name);
        std::fs::create_dir_all(&dir).map_err(BurrowError::io(&dir))?;
        let path = dir.join(RECORD_FILE);
        let raw = serde_json::to_vec_pretty(record)?;
        // Written in full under a per-id name, then linked into place:
        // `link` fails on an existing target, so the record either
        // appears complete or not at all.
        let staged = dir.join(format!("{RECORD_FILE}.{}.tmp", record.id));
        std::fs::write(&staged, raw).map_err(|e| {
            let _ = std::fs::remove_file(&staged);
            BurrowError::io(&staged)(e)
        })?;
        let linked = std::fs::hard_link(&staged, &path);
        let _ = std::fs::remove_file(&staged);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(MetadataError::DuplicateName {
                    name: record.name.clone(),
                });
            }
            Err(e) => return Err(BurrowError::io(&path)(e).into()),
        }
        tracing::debug!(name = %record.name, id = %record.id, "container recorded");
        Ok(())
    }

    /// Overwrites an existing record, e.g. after a status change.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no record to update.
    pub fn update(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_path(&record.name);
        if !path.exists() {
            return Err(MetadataError::NotFound {
                name: record.name.clone(),
            });
        }
        let raw = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(BurrowError::io(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(BurrowError::io(&path))?;
        Ok(())
    }

    /// Reads the record for `name`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such record.
    pub fn lookup(&self, name: &str) -> Result<ContainerRecord> {
        let path = self.record_path(name);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MetadataError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(BurrowError::io(&path)(e).into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    /// Returns every record, oldest first. Unreadable records are skipped
    /// with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be listed.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BurrowError::io(&self.dir)(e).into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(BurrowError::io(&self.dir))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.lookup(&name) {
                Ok(record) => records.push(record),
                Err(MetadataError::NotFound { .. }) => {}
                Err(e) => tracing::warn!(name, error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(records)
    }

    /// Removes the record for `name` together with its directory.
    ///
    /// An absent record is logged and treated as success.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn delete(&self, name: &str) -> Result<()> {
        let dir = self.container_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(name, "container record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(name, "container record already absent");
                Ok(())
            }
            Err(e) => Err(BurrowError::io(&dir)(e).into()),
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(RECORD_FILE)
    }

    /// Returns the store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
