//! Container record persistence.
//!
//! Each container owns `containers/<id>/config.json`; `containers/names.json`
//! maps human names to ids. All mutations run under an internal lock so a
//! load-modify-save cycle cannot interleave with another writer.

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::errors::{ServinError, ServinResult};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::types::{ContainerId, ContainerRecord, ContainerStatus};
use crate::store::{atomic_write_json, load_json};

const RECORD_FILE: &str = "config.json";
const NAME_INDEX: &str = "names.json";

/// Durable store for [`ContainerRecord`]s.
pub struct ContainerStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ContainerStore {
    pub fn new(layout: &FilesystemLayout) -> Self {
        Self {
            root: layout.containers_dir(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join(RECORD_FILE)
    }

    fn name_index_path(&self) -> PathBuf {
        self.root.join(NAME_INDEX)
    }

    fn load_name_index(&self) -> BTreeMap<String, String> {
        load_json(&self.name_index_path())
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Write or overwrite a record by id.
    pub fn save(&self, record: &ContainerRecord) -> ServinResult<()> {
        let _guard = self.write_lock.lock();
        atomic_write_json(&self.record_path(record.id.as_str()), record)?;

        let mut names = self.load_name_index();
        names.insert(record.name.clone(), record.id.as_str().to_string());
        atomic_write_json(&self.name_index_path(), &names)
    }

    /// Load a record by exact id.
    pub fn load(&self, id: &ContainerId) -> ServinResult<ContainerRecord> {
        load_json(&self.record_path(id.as_str()))?
            .ok_or_else(|| ServinError::NotFound(format!("container {id}")))
    }

    /// Resolve an id, unique id prefix, or name to a record.
    pub fn resolve(&self, id_or_name: &str) -> ServinResult<ContainerRecord> {
        // Exact id first.
        if let Some(record) = load_json(&self.record_path(id_or_name))? {
            return Ok(record);
        }

        // Exact name via the index.
        let names = self.load_name_index();
        if let Some(id) = names.get(id_or_name) {
            if let Some(record) = load_json(&self.record_path(id))? {
                return Ok(record);
            }
        }

        // Unique id prefix.
        let mut matches: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .map_err(|e| ServinError::Storage(format!("scan {}: {e}", self.root.display())))?
        {
            let entry = entry.map_err(|e| ServinError::Storage(e.to_string()))?;
            let file_name = entry.file_name();
            let candidate = file_name.to_string_lossy();
            if entry.path().is_dir() && candidate.starts_with(id_or_name) {
                matches.push(candidate.into_owned());
            }
        }
        match matches.len() {
            0 => Err(ServinError::NotFound(format!("container {id_or_name}"))),
            1 => load_json(&self.record_path(&matches[0]))?
                .ok_or_else(|| ServinError::NotFound(format!("container {id_or_name}"))),
            n => Err(ServinError::Ambiguous(format!(
                "container {id_or_name} matches {n} ids"
            ))),
        }
    }

    /// Atomic status update. NOT_FOUND when the record is missing.
    pub fn update_status(&self, id: &ContainerId, status: ContainerStatus) -> ServinResult<()> {
        let _guard = self.write_lock.lock();
        let mut record: ContainerRecord = load_json(&self.record_path(id.as_str()))?
            .ok_or_else(|| ServinError::NotFound(format!("container {id}")))?;
        record.status = status;
        atomic_write_json(&self.record_path(id.as_str()), &record)
    }

    /// Atomic pid update. NOT_FOUND when the record is missing.
    pub fn update_pid(&self, id: &ContainerId, pid: u32) -> ServinResult<()> {
        let _guard = self.write_lock.lock();
        let mut record: ContainerRecord = load_json(&self.record_path(id.as_str()))?
            .ok_or_else(|| ServinError::NotFound(format!("container {id}")))?;
        record.pid = pid;
        atomic_write_json(&self.record_path(id.as_str()), &record)
    }

    /// List all records, skipping any that fail validation.
    pub fn list(&self) -> ServinResult<Vec<ContainerRecord>> {
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
            let path = entry.path().join(RECORD_FILE);
            if let Some(record) = load_json::<ContainerRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Remove a record and its name index entry. The per-container directory
    /// itself (rootfs, logs) is the engine's to clean up.
    pub fn remove(&self, id: &ContainerId) -> ServinResult<()> {
        let _guard = self.write_lock.lock();
        let path = self.record_path(id.as_str());
        let record: Option<ContainerRecord> = load_json(&path)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServinError::NotFound(format!("container {id}")));
            }
            Err(e) => return Err(ServinError::Storage(format!("remove {}: {e}", path.display()))),
        }
        if let Some(record) = record {
            let mut names = self.load_name_index();
            if names.remove(&record.name).is_some() {
                atomic_write_json(&self.name_index_path(), &names)?;
            }
        }
        Ok(())
    }
}
