//! Local registry: a registry-v2 HTTP façade over the image store, plus the
//! client used for pull/push against remote registries.

mod client;
mod config;
mod server;

pub use client::RegistryClient;
pub use config::{CONFIG_FILE, RegistryConfig, RegistryCredentials};
pub use server::{RegistryServer, registry_router};

use crate::errors::{ServinError, ServinResult};

/// Extract config and layer digests from a manifest document.
///
/// Accepts both the canonical manifest written by the image store (string
/// digests) and conventional distribution/OCI manifests (descriptor objects).
pub(crate) fn manifest_digests(bytes: &[u8]) -> ServinResult<(String, Vec<String>)> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| ServinError::ImageCorrupt(format!("manifest is not JSON: {e}")))?;

    let config = value
        .get("config")
        .ok_or_else(|| ServinError::ImageCorrupt("manifest has no config".into()))?;
    let config_digest = match config {
        serde_json::Value::String(digest) => digest.clone(),
        other => other
            .get("digest")
            .and_then(|d| d.as_str())
            .map(str::to_string)
            .ok_or_else(|| ServinError::ImageCorrupt("config has no digest".into()))?,
    };

    let layers = value
        .get("layers")
        .and_then(|l| l.as_array())
        .ok_or_else(|| ServinError::ImageCorrupt("manifest has no layers".into()))?;
    let mut layer_digests = Vec::with_capacity(layers.len());
    for layer in layers {
        let digest = match layer {
            serde_json::Value::String(digest) => digest.clone(),
            other => other
                .get("digest")
                .and_then(|d| d.as_str())
                .map(str::to_string)
                .ok_or_else(|| ServinError::ImageCorrupt("layer has no digest".into()))?,
        };
        layer_digests.push(digest);
    }

    Ok((config_digest, layer_digests))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_shape() {
        let bytes = br#"{"schema_version":2,"config":"sha256:c","layers":["sha256:a","sha256:b"]}"#;
        let (config, layers) = manifest_digests(bytes).unwrap();
        assert_eq!(config, "sha256:c");
        assert_eq!(layers, vec!["sha256:a", "sha256:b"]);
    }

    #[test]
    fn test_distribution_shape() {
        let bytes = br#"{
            "schemaVersion": 2,
            "config": {"digest": "sha256:c", "size": 1},
            "layers": [{"digest": "sha256:a", "size": 2}]
        }"#;
        let (config, layers) = manifest_digests(bytes).unwrap();
        assert_eq!(config, "sha256:c");
        assert_eq!(layers, vec!["sha256:a"]);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(manifest_digests(b"not json").is_err());
        assert!(manifest_digests(b"{}").is_err());
    }
}
