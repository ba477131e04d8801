//! User-facing container creation options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ServinError, ServinResult};
use crate::runtime::types::{MountSpec, NetworkMode, PortMapping};

/// Configuration supplied at container creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerOptions {
    /// Optional human name; defaults to the first 12 chars of the id.
    #[serde(default)]
    pub name: String,
    /// Image reference (`name:tag`), resolved at start time.
    pub image: String,
    /// Command to execute; falls back to the image's configured command.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub network_mode: NetworkMode,
    /// Memory limit in bytes; 0 means unlimited.
    #[serde(default)]
    pub memory_limit: u64,
    /// CPU quota as fractional cores; 0.0 means unlimited.
    #[serde(default)]
    pub cpu_quota: f64,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Preserve the rootfs after a failed start, for debugging.
    #[serde(default)]
    pub keep_rootfs_on_failure: bool,
}

impl ContainerOptions {
    /// Validate fields that cannot be checked by the type system.
    pub fn validate(&self) -> ServinResult<()> {
        if self.image.is_empty() {
            return Err(ServinError::InvalidConfig("image reference is empty".into()));
        }
        for mount in &self.mounts {
            if !mount.target.starts_with('/') {
                return Err(ServinError::InvalidConfig(format!(
                    "mount target must be absolute: {}",
                    mount.target
                )));
            }
        }
        if self.cpu_quota < 0.0 {
            return Err(ServinError::InvalidConfig(format!(
                "cpu quota must be non-negative: {}",
                self.cpu_quota
            )));
        }
        Ok(())
    }
}

/// Parse a memory-size string: integer plus optional unit `k`/`m`/`g`
/// (case-insensitive). A bare integer is bytes.
pub fn parse_memory_string(s: &str) -> ServinResult<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ServinError::InvalidConfig("empty memory size".into()));
    }

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| ServinError::InvalidConfig(format!("invalid memory size: {s}")))?;

    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        other => {
            return Err(ServinError::InvalidConfig(format!(
                "invalid memory unit {other:?} in {s}"
            )));
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| ServinError::InvalidConfig(format!("memory size overflows: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_units() {
        assert_eq!(parse_memory_string("1024").unwrap(), 1024);
        assert_eq!(parse_memory_string("128m").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_memory_string("128M").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_memory_string("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_string("2k").unwrap(), 2048);
    }

    #[test]
    fn test_memory_rejects_garbage() {
        assert!(parse_memory_string("").is_err());
        assert!(parse_memory_string("12x").is_err());
        assert!(parse_memory_string("lots").is_err());
    }

    #[test]
    fn test_validate_requires_image() {
        let options = ContainerOptions::default();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_requires_absolute_mount_target() {
        let options = ContainerOptions {
            image: "alpine:latest".into(),
            mounts: vec![MountSpec {
                source: "/tmp/data".into(),
                target: "data".into(),
                read_only: false,
            }],
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
