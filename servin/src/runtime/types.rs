//! Core container record types.
//!
//! A [`ContainerRecord`] combines the immutable creation-time configuration
//! with the mutable lifecycle fields. The state store persists whole records;
//! clients only ever see read-only snapshots.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::runtime::options::ContainerOptions;

/// 128-bit random container id, rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wrap an id produced elsewhere (e.g. assigned inside the VM guest).
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, used as the default human name.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Container lifecycle state.
///
/// `removed` is terminal; the record is deleted when it is reached, so it is
/// only ever observed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Exited,
    Removed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Exited => "exited",
            Self::Removed => "removed",
        }
    }

    /// Running or paused: the init process is expected to exist.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

/// Network attachment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Veth pair attached to the managed bridge.
    #[default]
    Bridge,
    /// Share the host network namespace.
    Host,
    /// Network namespace with only loopback.
    None,
    /// Workload runs inside the managed VM guest.
    Vm,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Host => "host",
            Self::None => "none",
            Self::Vm => "vm",
        }
    }
}

/// A mounted volume or bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path (absolute) or volume name.
    pub source: String,
    /// Absolute path inside the container.
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Persisted container record: identity + configuration + current status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub status: ContainerStatus,
    /// Host pid of the init process; 0 when not running.
    #[serde(default)]
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Error message recorded when a start failed.
    #[serde(default)]
    pub error: Option<String>,
    /// CRI pod sandbox owning this container, when created through the CRI.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// IPv4 address on the managed bridge, when attached.
    #[serde(default)]
    pub ip_address: Option<String>,
    pub config: ContainerOptions,
}

impl ContainerRecord {
    /// Build a fresh record in the `created` state.
    pub fn new(options: ContainerOptions) -> Self {
        let id = ContainerId::generate();
        let name = if options.name.is_empty() {
            id.short().to_string()
        } else {
            options.name.clone()
        };
        Self {
            id,
            name,
            status: ContainerStatus::Created,
            pid: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            sandbox_id: None,
            ip_address: None,
            config: options,
        }
    }

    /// Labels attached at creation, for CRI list filters.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.config.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_32_hex_chars() {
        let id = ContainerId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_default_name_is_short_id() {
        let record = ContainerRecord::new(ContainerOptions::default());
        assert_eq!(record.name, record.id.short());
        assert_eq!(record.name.len(), 12);
    }

    #[test]
    fn test_explicit_name_wins() {
        let options = ContainerOptions {
            name: "web".into(),
            ..Default::default()
        };
        let record = ContainerRecord::new(options);
        assert_eq!(record.name, "web");
    }

    #[test]
    fn test_status_active() {
        assert!(ContainerStatus::Running.is_active());
        assert!(ContainerStatus::Paused.is_active());
        assert!(!ContainerStatus::Created.is_active());
        assert!(!ContainerStatus::Exited.is_active());
    }

    #[test]
    fn test_record_roundtrips_through_json() {
        let record = ContainerRecord::new(ContainerOptions::default());
        let json = serde_json::to_string(&record).unwrap();
        let back: ContainerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.status, ContainerStatus::Created);
    }
}
