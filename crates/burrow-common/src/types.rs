//! Domain primitive types used across the Burrow workspace.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::CONTAINER_ID_LEN;
use crate::error::BurrowError;

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID of hex characters.
    #[must_use]
    pub fn generate() -> Self {
        let mut raw = uuid::Uuid::new_v4().simple().to_string();
        raw.truncate(CONTAINER_ID_LEN);
        Self(raw)
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns at most the first `len` characters, for interface names.
    #[must_use]
    pub fn short(&self, len: usize) -> &str {
        self.0.get(..len).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource limits for a container.
///
/// A `None` or zero/empty field means the dimension is left at the
/// subsystem's own default, never "zero resources".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// CPU shares (relative weight, v1 semantics: 2..=262144).
    pub cpu_shares: Option<u64>,
    /// CPU bandwidth in microseconds per 100ms period.
    pub cpu_quota: Option<u64>,
    /// CPUs the container may run on, e.g. `0-2,4`.
    pub cpuset: Option<String>,
    /// Memory limit in bytes.
    pub memory_limit: Option<u64>,
}

impl ResourceConfig {
    /// CPU shares, if a non-zero value was requested.
    #[must_use]
    pub fn cpu_shares(&self) -> Option<u64> {
        self.cpu_shares.filter(|v| *v > 0)
    }

    /// CPU quota, if a non-zero value was requested.
    #[must_use]
    pub fn cpu_quota(&self) -> Option<u64> {
        self.cpu_quota.filter(|v| *v > 0)
    }

    /// CPU set, if a non-blank value was requested.
    #[must_use]
    pub fn cpuset(&self) -> Option<&str> {
        self.cpuset.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Memory limit, if a non-zero value was requested.
    #[must_use]
    pub fn memory_limit(&self) -> Option<u64> {
        self.memory_limit.filter(|v| *v > 0)
    }

    /// Returns `true` when no dimension carries a limit.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.cpu_shares().is_none()
            && self.cpu_quota().is_none()
            && self.cpuset().is_none()
            && self.memory_limit().is_none()
    }
}

/// Parses memory strings like `"100m"`, `"128MiB"`, `"1g"` into bytes.
///
/// Single-letter suffixes are binary multiples, as in `docker run -m`.
#[allow(clippy::option_if_let_else)]
#[must_use]
pub fn parse_memory(s: &str) -> Option<u64> {
    let s = s.trim();
    let lower = s.to_ascii_lowercase();
    let (num_str, multiplier): (&str, u64) = if let Some(n) = s.strip_suffix("GiB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("GB") {
        (n, 1_000_000_000)
    } else if let Some(n) = s.strip_suffix("MiB") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1_000_000)
    } else if let Some(n) = s.strip_suffix("KiB") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1000)
    } else if lower.ends_with('g') {
        (&s[..s.len() - 1], 1024 * 1024 * 1024)
    } else if lower.ends_with('m') {
        (&s[..s.len() - 1], 1024 * 1024)
    } else if lower.ends_with('k') {
        (&s[..s.len() - 1], 1024)
    } else {
        (s, 1)
    };
    num_str
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
}

/// Lifecycle status of a container record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The init process has been released and is running.
    Running,
    /// The container was stopped or aborted before it ran.
    Stopped,
    /// The foreground process exited.
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// A `hostPort:containerPort` TCP forwarding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortMapping {
    /// Port on the host.
    pub host: u16,
    /// Port inside the container.
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BurrowError::Config {
            message: format!("port mapping must be hostPort:containerPort, got {s:?}"),
        };
        let (host, container) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            host: host.trim().parse().map_err(|_| invalid())?,
            container: container.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for PortMapping {
    type Error = BurrowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortMapping> for String {
    fn from(value: PortMapping) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// A `hostPath:containerPath` bind mount request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeSpec {
    /// Directory on the host; created if absent.
    pub host: PathBuf,
    /// Mount point inside the container, relative to its root.
    pub container: PathBuf,
}

impl FromStr for VolumeSpec {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split(':').collect::<Vec<_>>().as_slice() {
            [host, container] if !host.is_empty() && !container.is_empty() => Ok(Self {
                host: PathBuf::from(host),
                container: PathBuf::from(container),
            }),
            _ => Err(BurrowError::Config {
                message: format!("volume must be hostPath:containerPath, got {s:?}"),
            }),
        }
    }
}

impl TryFrom<String> for VolumeSpec {
    type Error = BurrowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VolumeSpec> for String {
    fn from(value: VolumeSpec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_short_hex_and_distinct() {
        let a = ContainerId::generate();
        let b = ContainerId::generate();
        assert_eq!(a.as_str().len(), CONTAINER_ID_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn short_id_never_panics() {
        let id = ContainerId::new("abc");
        assert_eq!(id.short(8), "abc");
        assert_eq!(ContainerId::new("0123456789").short(4), "0123");
    }

    #[test]
    fn zero_and_blank_limits_are_unlimited() {
        let config = ResourceConfig {
            cpu_shares: Some(0),
            cpu_quota: Some(0),
            cpuset: Some("  ".into()),
            memory_limit: Some(0),
        };
        assert!(config.is_unlimited());
        assert!(ResourceConfig::default().is_unlimited());
    }

    #[test]
    fn parse_memory_docker_suffixes() {
        assert_eq!(parse_memory("100m"), Some(100 * 1024 * 1024));
        assert_eq!(parse_memory("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory("512k"), Some(512 * 1024));
    }

    #[test]
    fn parse_memory_mib_and_plain() {
        assert_eq!(parse_memory("128MiB"), Some(128 * 1024 * 1024));
        assert_eq!(parse_memory("1048576"), Some(1_048_576));
        assert_eq!(parse_memory("abc"), None);
    }

    #[test]
    fn port_mapping_parses_and_displays() {
        let mapping: PortMapping = "8080:80".parse().expect("parse");
        assert_eq!(mapping, PortMapping { host: 8080, container: 80 });
        assert_eq!(mapping.to_string(), "8080:80");
        assert!("8080".parse::<PortMapping>().is_err());
        assert!("x:80".parse::<PortMapping>().is_err());
    }

    #[test]
    fn port_mapping_serializes_as_string() {
        let json = serde_json::to_string(&PortMapping { host: 1, container: 2 }).expect("ser");
        assert_eq!(json, "\"1:2\"");
    }

    #[test]
    fn volume_spec_requires_both_sides() {
        let spec: VolumeSpec = "/data:/mnt/data".parse().expect("parse");
        assert_eq!(spec.host, PathBuf::from("/data"));
        assert_eq!(spec.container, PathBuf::from("/mnt/data"));
        assert!(":/mnt".parse::<VolumeSpec>().is_err());
        assert!("/a:/b:/c".parse::<VolumeSpec>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ContainerStatus::Running).expect("ser");
        assert_eq!(json, "\"running\"");
        assert_eq!(ContainerStatus::Exited.to_string(), "exited");
    }
}
