//! CRI pod sandbox record persistence.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{ServinError, ServinResult};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::types::NetworkMode;
use crate::store::{atomic_write_json, load_json};

/// Sandbox readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Ready,
    NotReady,
}

/// A CRI pod sandbox: a group of containers sharing one network namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSandboxRecord {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub log_directory: String,
    pub state: SandboxState,
    pub network_mode: NetworkMode,
    pub created_at: DateTime<Utc>,
}

/// Durable store for [`PodSandboxRecord`]s, one file per sandbox id.
pub struct SandboxStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl SandboxStore {
    pub fn new(layout: &FilesystemLayout) -> Self {
        Self {
            root: layout.sandboxes_dir(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    pub fn save(&self, record: &PodSandboxRecord) -> ServinResult<()> {
        let _guard = self.write_lock.lock();
        atomic_write_json(&self.record_path(&record.id), record)
    }

    pub fn load(&self, id: &str) -> ServinResult<PodSandboxRecord> {
        load_json(&self.record_path(id))?
            .ok_or_else(|| ServinError::NotFound(format!("sandbox {id}")))
    }

    pub fn update_state(&self, id: &str, state: SandboxState) -> ServinResult<()> {
        let _guard = self.write_lock.lock();
        let mut record: PodSandboxRecord = load_json(&self.record_path(id))?
            .ok_or_else(|| ServinError::NotFound(format!("sandbox {id}")))?;
        record.state = state;
        atomic_write_json(&self.record_path(id), &record)
    }

    pub fn list(&self) -> ServinResult<Vec<PodSandboxRecord>> {
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
            if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = load_json::<PodSandboxRecord>(&entry.path())? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    pub fn remove(&self, id: &str) -> ServinResult<()> {
        let _guard = self.write_lock.lock();
        match std::fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServinError::NotFound(format!("sandbox {id}")))
            }
            Err(e) => Err(ServinError::Storage(format!("remove sandbox {id}: {e}"))),
        }
    }
}
