//! Image tarball import and export.
//!
//! The archive layout is `manifest.json` (a one-entry array naming the config
//! file, repo tags and layer paths), `config.json`, and one
//! `<layer-id>/layer.tar` per layer where the layer id is the SHA-256 hex of
//! the layer bytes. Import rejects any archive whose layer bytes do not hash
//! to their declared id.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ServinError, ServinResult};
use crate::images::store::ImageStore;
use crate::images::types::{ImageConfigBlob, ImageManifest, ImageRecord};

/// One entry of the tarball's top-level `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TarballManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

impl ImageStore {
    /// Import an image tarball, optionally applying an extra tag.
    pub fn import_tarball(&self, tar_bytes: &[u8], tag: Option<&str>) -> ServinResult<ImageRecord> {
        let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        for entry in archive
            .entries()
            .map_err(|e| ServinError::ImageCorrupt(format!("unreadable tarball: {e}")))?
        {
            let mut entry =
                entry.map_err(|e| ServinError::ImageCorrupt(format!("bad tar entry: {e}")))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry
                .path()
                .map_err(|e| ServinError::ImageCorrupt(format!("bad entry path: {e}")))?
                .to_string_lossy()
                .into_owned();
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| ServinError::ImageCorrupt(format!("truncated entry {path}: {e}")))?;
            files.insert(path, bytes);
        }

        let manifest_bytes = files
            .get("manifest.json")
            .ok_or_else(|| ServinError::ImageCorrupt("tarball has no manifest.json".into()))?;
        let entries: Vec<TarballManifestEntry> = serde_json::from_slice(manifest_bytes)
            .map_err(|e| ServinError::ImageCorrupt(format!("manifest.json: {e}")))?;
        let entry = entries
            .first()
            .ok_or_else(|| ServinError::ImageCorrupt("manifest.json is empty".into()))?;

        let config_bytes = files
            .get(&entry.config)
            .ok_or_else(|| ServinError::ImageCorrupt(format!("missing {}", entry.config)))?;
        // Parse to validate shape before anything lands in the store.
        let _: ImageConfigBlob = serde_json::from_slice(config_bytes)
            .map_err(|e| ServinError::ImageCorrupt(format!("{}: {e}", entry.config)))?;

        let mut layer_digests = Vec::with_capacity(entry.layers.len());
        let mut total_size = 0u64;
        for layer_path in &entry.layers {
            let declared_id = layer_path
                .split('/')
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    ServinError::ImageCorrupt(format!("bad layer path {layer_path}"))
                })?;
            let bytes = files
                .get(layer_path)
                .ok_or_else(|| ServinError::ImageCorrupt(format!("missing layer {layer_path}")))?;

            let actual = hex::encode(Sha256::digest(bytes));
            if actual != declared_id {
                return Err(ServinError::ImageCorrupt(format!(
                    "layer {layer_path} hashes to {actual}"
                )));
            }

            total_size += bytes.len() as u64;
            layer_digests.push(self.put_blob(bytes)?);
        }

        let config_digest = self.put_blob(config_bytes)?;
        let manifest = ImageManifest::new(config_digest, layer_digests);

        let mut tags = entry.repo_tags.clone();
        if let Some(tag) = tag {
            tags.push(tag.to_string());
        }
        self.register_image(&manifest, total_size, &tags)
    }

    /// Export an image as a tarball, the inverse of
    /// [`import_tarball`](Self::import_tarball).
    pub fn export_tarball(&self, reference: &str) -> ServinResult<Vec<u8>> {
        let record = self.inspect(reference)?;
        let manifest = self.load_manifest(&record.id)?;
        let config_bytes = self.read_blob(&manifest.config)?;

        let mut layer_paths = Vec::with_capacity(manifest.layers.len());
        let mut layer_blobs = Vec::with_capacity(manifest.layers.len());
        for digest in &manifest.layers {
            let hex_id = digest.strip_prefix("sha256:").unwrap_or(digest);
            layer_paths.push(format!("{hex_id}/layer.tar"));
            layer_blobs.push(self.read_blob(digest)?);
        }

        let top = vec![TarballManifestEntry {
            config: "config.json".to_string(),
            repo_tags: record.repo_tags,
            layers: layer_paths.clone(),
        }];
        let top_bytes = serde_json::to_vec_pretty(&top)?;

        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "manifest.json", &top_bytes)?;
        append_file(&mut builder, "config.json", &config_bytes)?;
        for (path, bytes) in layer_paths.iter().zip(&layer_blobs) {
            append_file(&mut builder, path, bytes)?;
        }
        builder
            .into_inner()
            .map_err(|e| ServinError::Storage(format!("finalize tarball: {e}")))
    }
}

fn append_file(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    bytes: &[u8],
) -> ServinResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder
        .append_data(&mut header, path, bytes)
        .map_err(|e| ServinError::Storage(format!("append {path}: {e}")))?;
    Ok(())
}
