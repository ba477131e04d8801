//! Volume record persistence.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{ServinError, ServinResult};
use crate::runtime::layout::FilesystemLayout;
use crate::store::{atomic_write_json, load_json};

const RECORD_FILE: &str = "volume.json";
const DATA_DIR: &str = "_data";

/// Named persistent storage record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub driver: String,
    pub mountpoint: PathBuf,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Durable store for [`VolumeRecord`]s. The record lives next to the data
/// directory it describes: `volumes/<name>/volume.json` + `volumes/<name>/_data`.
pub struct VolumeStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl VolumeStore {
    pub fn new(layout: &FilesystemLayout) -> Self {
        Self {
            root: layout.volumes_dir(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join(RECORD_FILE)
    }

    /// Host path that containers bind-mount.
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.root.join(name).join(DATA_DIR)
    }

    /// Create a volume record and its data directory.
    pub fn create(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> ServinResult<VolumeRecord> {
        if name.is_empty() || name.contains('/') {
            return Err(ServinError::InvalidConfig(format!(
                "invalid volume name: {name:?}"
            )));
        }
        let _guard = self.write_lock.lock();
        if self.record_path(name).exists() {
            return Err(ServinError::AlreadyExists(format!("volume {name}")));
        }

        let mountpoint = self.mountpoint(name);
        std::fs::create_dir_all(&mountpoint)
            .map_err(|e| ServinError::Storage(format!("create {}: {e}", mountpoint.display())))?;

        let record = VolumeRecord {
            name: name.to_string(),
            driver: "local".to_string(),
            mountpoint,
            labels,
            created_at: Utc::now(),
        };
        atomic_write_json(&self.record_path(name), &record)?;
        Ok(record)
    }

    /// Load an existing volume, or create it on first reference.
    pub fn ensure(&self, name: &str) -> ServinResult<VolumeRecord> {
        match self.load(name) {
            Ok(record) => Ok(record),
            Err(ServinError::NotFound(_)) => self.create(name, BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    pub fn load(&self, name: &str) -> ServinResult<VolumeRecord> {
        load_json(&self.record_path(name))?
            .ok_or_else(|| ServinError::NotFound(format!("volume {name}")))
    }

    pub fn list(&self) -> ServinResult<Vec<VolumeRecord>> {
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => {
                return Err(ServinError::Storage(format!(
                    "scan {}: {e}",
                    self.root.display()
                )));
            }
        };
        for entry in entries {
            let entry = entry.map_err(|e| ServinError::Storage(e.to_string()))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(record) = load_json::<VolumeRecord>(&entry.path().join(RECORD_FILE))? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Remove a volume record and its data directory.
    pub fn remove(&self, name: &str) -> ServinResult<()> {
        let _guard = self.write_lock.lock();
        if !self.record_path(name).exists() {
            return Err(ServinError::NotFound(format!("volume {name}")));
        }
        let dir = self.root.join(name);
        std::fs::remove_dir_all(&dir)
            .map_err(|e| ServinError::Storage(format!("remove {}: {e}", dir.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, VolumeStore) {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        (dir, VolumeStore::new(&layout))
    }

    #[test]
    fn test_create_and_load() {
        let (_dir, store) = test_store();
        let record = store.create("data", BTreeMap::new()).unwrap();
        assert_eq!(record.driver, "local");
        assert!(record.mountpoint.is_dir());

        let back = store.load("data").unwrap();
        assert_eq!(back.name, "data");
    }

    #[test]
    fn test_duplicate_create_fails() {
        let (_dir, store) = test_store();
        store.create("data", BTreeMap::new()).unwrap();
        assert!(matches!(
            store.create("data", BTreeMap::new()),
            Err(ServinError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_ensure_creates_on_first_reference() {
        let (_dir, store) = test_store();
        let record = store.ensure("cache").unwrap();
        assert_eq!(record.name, "cache");
        // Second call loads the same record.
        let again = store.ensure("cache").unwrap();
        assert_eq!(again.created_at, record.created_at);
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = test_store();
        store.create("data", BTreeMap::new()).unwrap();
        store.remove("data").unwrap();
        assert!(matches!(
            store.load("data"),
            Err(ServinError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let (_dir, store) = test_store();
        assert!(store.create("", BTreeMap::new()).is_err());
        assert!(store.create("a/b", BTreeMap::new()).is_err());
    }
}
