//! Content-addressed image repository.
//!
//! Layout under `<base>/images/`:
//!
//! ```text
//! blobs/sha256/<hex>     — layer and config blobs
//! manifests/<id>.json    — canonical manifests, named by image id
//! tags.json              — tag index: tag -> id, plus per-id metadata
//! ```
//!
//! The tag index is guarded by a single writer/many readers lock; every
//! mutation is persisted with the tmp+rename idiom before it becomes visible.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ServinError, ServinResult};
use crate::images::reference::ImageReference;
use crate::images::types::{ImageConfigBlob, ImageManifest, ImageRecord};
use crate::runtime::layout::FilesystemLayout;
use crate::store::{atomic_write, load_json};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ImageMeta {
    size: u64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct TagIndex {
    /// `name:tag` -> image id.
    tags: BTreeMap<String, String>,
    /// image id -> metadata.
    images: BTreeMap<String, ImageMeta>,
}

/// Content-addressed image store with a tag index.
pub struct ImageStore {
    root: PathBuf,
    index: RwLock<TagIndex>,
}

impl ImageStore {
    /// Open (or initialize) the store under the layout's images directory.
    pub fn open(layout: &FilesystemLayout) -> ServinResult<Self> {
        let root = layout.images_dir();
        for dir in [root.join("blobs").join("sha256"), root.join("manifests")] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| ServinError::Storage(format!("create {}: {e}", dir.display())))?;
        }
        let index: TagIndex = load_json(&root.join("tags.json"))?.unwrap_or_default();
        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("tags.json")
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.root.join("manifests").join(format!("{id}.json"))
    }

    fn persist_index(&self, index: &TagIndex) -> ServinResult<()> {
        atomic_write(&self.index_path(), &serde_json::to_vec_pretty(index)?)
    }

    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Path of a blob; `digest` is `sha256:<hex>` or bare hex.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join("blobs").join("sha256").join(hex)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Store bytes content-addressed; returns the `sha256:<hex>` digest.
    pub fn put_blob(&self, bytes: &[u8]) -> ServinResult<String> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(bytes)));
        let path = self.blob_path(&digest);
        if !path.exists() {
            atomic_write(&path, bytes)?;
        }
        Ok(digest)
    }

    pub fn read_blob(&self, digest: &str) -> ServinResult<Vec<u8>> {
        std::fs::read(self.blob_path(digest))
            .map_err(|_| ServinError::NotFound(format!("blob {digest}")))
    }

    // ------------------------------------------------------------------
    // Manifests and records
    // ------------------------------------------------------------------

    /// Register an image from its manifest + config blob. Layers and config
    /// must already be in the blob store. Applies the given tags, displacing
    /// any previous owner of each tag.
    pub fn register_image(
        &self,
        manifest: &ImageManifest,
        size: u64,
        tags: &[String],
    ) -> ServinResult<ImageRecord> {
        for layer in &manifest.layers {
            if !self.has_blob(layer) {
                return Err(ServinError::ImageCorrupt(format!(
                    "manifest references missing layer {layer}"
                )));
            }
        }
        if !self.has_blob(&manifest.config) {
            return Err(ServinError::ImageCorrupt(format!(
                "manifest references missing config {}",
                manifest.config
            )));
        }

        let id = manifest.image_id();
        atomic_write(&self.manifest_path(&id), &manifest.canonical_bytes())?;

        let mut index = self.index.write();
        index.images.entry(id.clone()).or_insert(ImageMeta {
            size,
            created_at: Utc::now(),
        });
        for tag in tags {
            let reference = ImageReference::parse(tag)?;
            index.tags.insert(reference.canonical(), id.clone());
        }
        self.persist_index(&index)?;
        drop(index);

        self.record(&id)
    }

    /// Resolve a tag, image id, or unique id prefix to an image id.
    pub fn resolve(&self, reference: &str) -> ServinResult<String> {
        let index = self.index.read();

        if let Ok(parsed) = ImageReference::parse(reference) {
            if let Some(id) = index.tags.get(&parsed.canonical()) {
                return Ok(id.clone());
            }
        }
        if index.images.contains_key(reference) {
            return Ok(reference.to_string());
        }

        let matches: Vec<&String> = index
            .images
            .keys()
            .filter(|id| id.starts_with(reference))
            .collect();
        match matches.len() {
            1 => Ok(matches[0].clone()),
            0 => Err(ServinError::ImageNotFound(reference.to_string())),
            n => Err(ServinError::Ambiguous(format!(
                "image {reference} matches {n} ids"
            ))),
        }
    }

    /// Load the canonical manifest for an image id.
    pub fn load_manifest(&self, id: &str) -> ServinResult<ImageManifest> {
        load_json(&self.manifest_path(id))?
            .ok_or_else(|| ServinError::ImageNotFound(id.to_string()))
    }

    /// Raw canonical manifest bytes, as served by the registry.
    pub fn manifest_bytes(&self, id: &str) -> ServinResult<Vec<u8>> {
        std::fs::read(self.manifest_path(id))
            .map_err(|_| ServinError::ImageNotFound(id.to_string()))
    }

    fn record(&self, id: &str) -> ServinResult<ImageRecord> {
        let manifest = self.load_manifest(id)?;
        let config: ImageConfigBlob = serde_json::from_slice(&self.read_blob(&manifest.config)?)
            .map_err(|e| ServinError::ImageCorrupt(format!("config blob of {id}: {e}")))?;

        let index = self.index.read();
        let meta = index.images.get(id).cloned().unwrap_or_default();
        let repo_tags: Vec<String> = index
            .tags
            .iter()
            .filter(|(_, v)| v.as_str() == id)
            .map(|(k, _)| k.clone())
            .collect();

        Ok(ImageRecord {
            id: id.to_string(),
            repo_tags,
            layers: manifest.layers,
            config: config.config,
            size: meta.size,
            created_at: meta.created_at,
        })
    }

    /// Full record for a tag, id, or id prefix.
    pub fn inspect(&self, reference: &str) -> ServinResult<ImageRecord> {
        let id = self.resolve(reference)?;
        self.record(&id)
    }

    /// All images, newest first.
    pub fn list(&self) -> ServinResult<Vec<ImageRecord>> {
        let ids: Vec<String> = self.index.read().images.keys().cloned().collect();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.record(&id) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(image = %id, error = %e, "skipping unreadable image"),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Apply `target_tag` to the image named by `source_ref`.
    pub fn tag(&self, source_ref: &str, target_tag: &str) -> ServinResult<()> {
        let id = self.resolve(source_ref)?;
        let target = ImageReference::parse(target_tag)?;
        let mut index = self.index.write();
        index.tags.insert(target.canonical(), id);
        self.persist_index(&index)
    }

    /// Remove an image by tag or id.
    ///
    /// Removing a tag only unlinks it while other tags remain. The image
    /// itself (manifest, config, unshared layers) is destroyed when the last
    /// tag goes. `in_use` reflects live container references; it blocks
    /// removal unless `force` is set.
    pub fn remove(&self, reference: &str, force: bool, in_use: bool) -> ServinResult<()> {
        let id = self.resolve(reference)?;
        if in_use && !force {
            return Err(ServinError::InUse(format!(
                "image {reference} is referenced by a container"
            )));
        }

        let mut index = self.index.write();
        let tag_key = ImageReference::parse(reference)
            .ok()
            .map(|r| r.canonical())
            .filter(|key| index.tags.get(key).map(String::as_str) == Some(id.as_str()));

        match tag_key {
            Some(key) => {
                index.tags.remove(&key);
            }
            // Referenced by id: drop every tag pointing at it.
            None => index.tags.retain(|_, v| v.as_str() != id.as_str()),
        }

        let still_tagged = index.tags.values().any(|v| v.as_str() == id.as_str());
        if still_tagged {
            return self.persist_index(&index);
        }

        index.images.remove(&id);
        self.persist_index(&index)?;
        drop(index);

        self.destroy_image(&id)
    }

    /// Delete a manifest and garbage-collect blobs no other image references.
    fn destroy_image(&self, id: &str) -> ServinResult<()> {
        let manifest = self.load_manifest(id)?;
        std::fs::remove_file(self.manifest_path(id)).ok();

        let mut live: BTreeSet<String> = BTreeSet::new();
        let manifests_dir = self.root.join("manifests");
        if let Ok(entries) = std::fs::read_dir(&manifests_dir) {
            for entry in entries.flatten() {
                if let Some(other) = load_json::<ImageManifest>(&entry.path())? {
                    live.insert(other.config.clone());
                    live.extend(other.layers);
                }
            }
        }

        for digest in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
            if !live.contains(digest) {
                if let Err(e) = std::fs::remove_file(self.blob_path(digest)) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(blob = %digest, error = %e, "failed to gc blob");
                    }
                }
            }
        }
        tracing::debug!(image = %id, "destroyed image");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registry support
    // ------------------------------------------------------------------

    /// Repository names for the registry catalog.
    pub fn repositories(&self) -> Vec<String> {
        let index = self.index.read();
        let mut names: Vec<String> = index
            .tags
            .keys()
            .filter_map(|tag| tag.rsplit_once(':').map(|(name, _)| name.to_string()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Tags of one repository name.
    pub fn tags_of(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}:");
        let index = self.index.read();
        index
            .tags
            .keys()
            .filter_map(|tag| tag.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Look up the image id a `name:tag` points at, without prefix matching.
    pub fn lookup_tag(&self, name: &str, tag: &str) -> Option<String> {
        self.index.read().tags.get(&format!("{name}:{tag}")).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::types::RuntimeDefaults;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, ImageStore) {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        (dir, ImageStore::open(&layout).unwrap())
    }

    fn register(store: &ImageStore, tag: &str, layer_bytes: &[u8]) -> ImageRecord {
        let layer = store.put_blob(layer_bytes).unwrap();
        let config_bytes =
            serde_json::to_vec(&ImageConfigBlob::new(RuntimeDefaults::default())).unwrap();
        let config = store.put_blob(&config_bytes).unwrap();
        let manifest = ImageManifest::new(config, vec![layer]);
        store
            .register_image(&manifest, layer_bytes.len() as u64, &[tag.to_string()])
            .unwrap()
    }

    #[test]
    fn test_register_resolve_inspect() {
        let (_dir, store) = test_store();
        let record = register(&store, "alpine:latest", b"layer-bytes");

        assert_eq!(store.resolve("alpine").unwrap(), record.id);
        assert_eq!(store.resolve("alpine:latest").unwrap(), record.id);
        assert_eq!(store.resolve(&record.id[..10]).unwrap(), record.id);

        let inspected = store.inspect("alpine").unwrap();
        assert_eq!(inspected.repo_tags, vec!["alpine:latest"]);
        assert_eq!(inspected.layers.len(), 1);
    }

    #[test]
    fn test_two_tags_one_id() {
        let (_dir, store) = test_store();
        let record = register(&store, "alpine:latest", b"bytes");
        store.tag("alpine:latest", "mirror/alpine:v1").unwrap();

        assert_eq!(store.resolve("mirror/alpine:v1").unwrap(), record.id);
        assert_eq!(store.inspect(&record.id).unwrap().repo_tags.len(), 2);
    }

    #[test]
    fn test_retag_displaces_previous_owner() {
        let (_dir, store) = test_store();
        let old = register(&store, "app:latest", b"v1");
        let new = register(&store, "app:next", b"v2");
        store.tag("app:next", "app:latest").unwrap();

        assert_eq!(store.resolve("app:latest").unwrap(), new.id);
        assert_ne!(old.id, new.id);
    }

    #[test]
    fn test_remove_tag_keeps_image_while_tagged() {
        let (_dir, store) = test_store();
        let record = register(&store, "app:latest", b"bytes");
        store.tag("app:latest", "app:stable").unwrap();

        store.remove("app:latest", false, false).unwrap();
        assert!(store.resolve("app:latest").is_err());
        assert_eq!(store.resolve("app:stable").unwrap(), record.id);
    }

    #[test]
    fn test_remove_last_tag_garbage_collects() {
        let (_dir, store) = test_store();
        let record = register(&store, "app:latest", b"unique-layer");
        let layer = record.layers[0].clone();

        store.remove("app:latest", false, false).unwrap();
        assert!(store.resolve(&record.id).is_err());
        assert!(!store.has_blob(&layer));
    }

    #[test]
    fn test_shared_layers_survive_gc() {
        let (_dir, store) = test_store();
        let shared = store.put_blob(b"shared-layer").unwrap();
        let config_bytes =
            serde_json::to_vec(&ImageConfigBlob::new(RuntimeDefaults::default())).unwrap();

        let config_a = store.put_blob(&config_bytes).unwrap();
        let a = ImageManifest::new(config_a.clone(), vec![shared.clone()]);
        store.register_image(&a, 1, &["a:latest".into()]).unwrap();

        let extra = store.put_blob(b"extra-layer").unwrap();
        let b = ImageManifest::new(config_a, vec![shared.clone(), extra]);
        store.register_image(&b, 2, &["b:latest".into()]).unwrap();

        store.remove("b:latest", false, false).unwrap();
        assert!(store.has_blob(&shared));
    }

    #[test]
    fn test_remove_in_use_requires_force() {
        let (_dir, store) = test_store();
        register(&store, "app:latest", b"bytes");

        assert!(matches!(
            store.remove("app:latest", false, true),
            Err(ServinError::InUse(_))
        ));
        store.remove("app:latest", true, true).unwrap();
    }

    #[test]
    fn test_catalog_views() {
        let (_dir, store) = test_store();
        register(&store, "alpine:latest", b"a");
        register(&store, "team/app:v1", b"b");
        store.tag("team/app:v1", "team/app:v2").unwrap();

        assert_eq!(store.repositories(), vec!["alpine", "team/app"]);
        assert_eq!(store.tags_of("team/app"), vec!["v1", "v2"]);
        assert!(store.lookup_tag("alpine", "latest").is_some());
    }
}
