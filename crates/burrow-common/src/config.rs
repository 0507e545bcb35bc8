//! Global configuration model for the Burrow runtime.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{BurrowError, Result};

/// Root configuration for the Burrow runtime.
///
/// Every on-disk location is derived from `root`, so pointing two runtimes
/// at different roots gives them fully separate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base directory for Burrow state and data.
    pub root: PathBuf,
    /// Mount point of the cgroup filesystem.
    pub cgroup_root: PathBuf,
    /// Parent hierarchy for per-container cgroups.
    pub cgroup_parent: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::with_root(constants::DEFAULT_ROOT)
    }
}

impl RuntimeConfig {
    /// Creates a configuration with defaults rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cgroup_root: PathBuf::from(constants::CGROUP_ROOT),
            cgroup_parent: constants::CGROUP_PARENT.to_string(),
        }
    }

    /// Resolves the effective configuration.
    ///
    /// The root is taken from `root_override`, then `$BURROW_ROOT`, then the
    /// built-in default. If `<root>/config.json` exists its fields overlay the
    /// defaults; the resolved root always wins over the file's `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read
    /// or parsed.
    pub fn resolve(root_override: Option<&Path>) -> Result<Self> {
        let root = root_override
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(constants::ROOT_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(constants::DEFAULT_ROOT));

        let file = root.join(constants::CONFIG_FILE);
        let mut config = if file.exists() {
            let raw = std::fs::read_to_string(&file).map_err(BurrowError::io(&file))?;
            serde_json::from_str::<Self>(&raw)?
        } else {
            Self::default()
        };
        config.root = root;
        tracing::debug!(root = %config.root.display(), "runtime configuration resolved");
        Ok(config)
    }

    /// Directory holding one metadata directory per container name.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory holding image tarballs.
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Directory holding unpacked, read-only base layers.
    #[must_use]
    pub fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    /// Directory holding per-container writable layers and merged mounts.
    #[must_use]
    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join("overlay")
    }

    /// Directory holding network definitions, endpoints and IPAM state.
    #[must_use]
    pub fn network_dir(&self) -> PathBuf {
        self.root.join("network")
    }
}
