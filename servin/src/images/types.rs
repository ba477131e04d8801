//! Image manifest and config documents.
//!
//! The canonical manifest is the identity of an image: the image id is the
//! SHA-256 over its serialized bytes. Wall-clock timestamps are deliberately
//! kept out of both the manifest and the config blob so that identical builds
//! hash to identical ids; creation time lives only in the tag index.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Canonical image manifest: config digest plus ordered layer digests, all in
/// `sha256:<hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub schema_version: u32,
    pub config: String,
    pub layers: Vec<String>,
}

impl ImageManifest {
    pub fn new(config_digest: String, layers: Vec<String>) -> Self {
        Self {
            schema_version: 2,
            config: config_digest,
            layers,
        }
    }

    /// Serialized canonical bytes. Struct field order is fixed, so the same
    /// manifest always produces the same bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("manifest serialization cannot fail")
    }

    /// The image id: SHA-256 hex over the canonical bytes.
    pub fn image_id(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }
}

/// Runtime defaults inherited from build, stored in the config blob using
/// the conventional field names so imported tarballs parse directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDefaults {
    #[serde(default, rename = "Cmd", skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default, rename = "Entrypoint", skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, rename = "Env", skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, rename = "WorkingDir", skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, rename = "User", skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(
        default,
        rename = "ExposedPorts",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    #[serde(default, rename = "Labels", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, rename = "Volumes", skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_json::Value>,
}

impl RuntimeDefaults {
    /// Look up an environment value by key (entries are `KEY=VALUE`).
    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Insert or replace an environment entry.
    pub fn env_set(&mut self, key: &str, value: &str) {
        let entry = format!("{key}={value}");
        if let Some(existing) = self
            .env
            .iter_mut()
            .find(|e| e.split_once('=').map(|(k, _)| k) == Some(key))
        {
            *existing = entry;
        } else {
            self.env.push(entry);
        }
    }
}

/// Image config blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfigBlob {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub config: RuntimeDefaults,
}

impl ImageConfigBlob {
    pub fn new(config: RuntimeDefaults) -> Self {
        Self {
            architecture: std::env::consts::ARCH.to_string(),
            os: "linux".to_string(),
            config,
        }
    }
}

/// Snapshot of an image as seen by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// SHA-256 hex of the canonical manifest.
    pub id: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
    pub config: RuntimeDefaults,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_id_is_stable() {
        let m = ImageManifest::new("sha256:abc".into(), vec!["sha256:l1".into()]);
        assert_eq!(m.image_id(), m.image_id());
        assert_eq!(m.image_id().len(), 64);
    }

    #[test]
    fn test_manifest_id_changes_with_layers() {
        let a = ImageManifest::new("sha256:abc".into(), vec![]);
        let b = ImageManifest::new("sha256:abc".into(), vec!["sha256:l1".into()]);
        assert_ne!(a.image_id(), b.image_id());
    }

    #[test]
    fn test_env_set_replaces() {
        let mut defaults = RuntimeDefaults::default();
        defaults.env_set("APP", "1");
        defaults.env_set("APP", "2");
        assert_eq!(defaults.env, vec!["APP=2"]);
        assert_eq!(defaults.env_get("APP"), Some("2"));
    }

    #[test]
    fn test_config_blob_parses_conventional_field_names() {
        let json = r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Cmd": ["/bin/sh"],
                "Env": ["PATH=/usr/bin"],
                "WorkingDir": "/app",
                "Labels": {"team": "core"}
            }
        }"#;
        let blob: ImageConfigBlob = serde_json::from_str(json).unwrap();
        assert_eq!(blob.config.cmd, vec!["/bin/sh"]);
        assert_eq!(blob.config.env_get("PATH"), Some("/usr/bin"));
        assert_eq!(blob.config.labels.get("team").unwrap(), "core");
    }
}
