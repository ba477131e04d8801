//! Thread-safe container manager.
//!
//! Owns the in-memory record cache and the durable store. All mutations are
//! store-first: the new bytes land on disk before the cache (and therefore
//! any reader) sees them, so the store stays the single source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::{ServinError, ServinResult};
use crate::runtime::types::{ContainerId, ContainerRecord, ContainerStatus};
use crate::store::ContainerStore;
use crate::util::is_process_alive;

/// Filters for [`ContainerManager::list`].
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub status: Option<ContainerStatus>,
    pub sandbox_id: Option<String>,
    pub name: Option<String>,
    pub label_selector: std::collections::BTreeMap<String, String>,
}

impl ContainerFilter {
    fn matches(&self, record: &ContainerRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(sandbox) = &self.sandbox_id {
            if record.sandbox_id.as_deref() != Some(sandbox.as_str()) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &record.name != name {
                return false;
            }
        }
        self.label_selector
            .iter()
            .all(|(k, v)| record.labels().get(k) == Some(v))
    }
}

struct ManagerInner {
    cache: HashMap<ContainerId, ContainerRecord>,
    store: ContainerStore,
}

/// Shared, cloneable manager handle.
#[derive(Clone)]
pub struct ContainerManager {
    inner: Arc<RwLock<ManagerInner>>,
}

impl std::fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerManager").finish()
    }
}

impl ContainerManager {
    pub fn new(store: ContainerStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ManagerInner {
                cache: HashMap::new(),
                store,
            })),
        }
    }

    /// Load every persisted record into the cache, reconciling stale state:
    /// a record claiming `running` whose pid is gone becomes `exited`.
    pub fn recover(&self) -> ServinResult<usize> {
        let mut inner = self.inner.write();
        let records = inner.store.list()?;
        let count = records.len();

        for mut record in records {
            if record.status.is_active() && !is_process_alive(record.pid) {
                tracing::warn!(
                    container = %record.id,
                    pid = record.pid,
                    "recovered container without live process, marking exited"
                );
                record.status = ContainerStatus::Exited;
                record.pid = 0;
                record.error = Some("runtime restarted while container was running".into());
                inner.store.save(&record)?;
            }
            inner.cache.insert(record.id.clone(), record);
        }

        tracing::info!(count, "container recovery complete");
        Ok(count)
    }

    /// Register a new record. Store-first.
    pub fn register(&self, record: ContainerRecord) -> ServinResult<()> {
        let mut inner = self.inner.write();
        if inner.cache.contains_key(&record.id) {
            return Err(ServinError::AlreadyExists(format!("container {}", record.id)));
        }
        if inner.cache.values().any(|r| r.name == record.name) {
            return Err(ServinError::AlreadyExists(format!(
                "container name {:?}",
                record.name
            )));
        }
        inner.store.save(&record)?;
        tracing::debug!(container = %record.id, name = %record.name, "registered container");
        inner.cache.insert(record.id.clone(), record);
        Ok(())
    }

    /// Resolve an id, unique id prefix, or name to a record snapshot.
    pub fn resolve(&self, id_or_name: &str) -> ServinResult<ContainerRecord> {
        let inner = self.inner.read();

        if let Some(record) = inner
            .cache
            .values()
            .find(|r| r.id.as_str() == id_or_name || r.name == id_or_name)
        {
            return Ok(record.clone());
        }

        let matches: Vec<&ContainerRecord> = inner
            .cache
            .values()
            .filter(|r| r.id.as_str().starts_with(id_or_name))
            .collect();
        match matches.len() {
            1 => Ok(matches[0].clone()),
            0 => Err(ServinError::NotFound(format!("container {id_or_name}"))),
            n => Err(ServinError::Ambiguous(format!(
                "container {id_or_name} matches {n} ids"
            ))),
        }
    }

    /// Snapshot by exact id.
    pub fn get(&self, id: &ContainerId) -> ServinResult<ContainerRecord> {
        self.inner
            .read()
            .cache
            .get(id)
            .cloned()
            .ok_or_else(|| ServinError::NotFound(format!("container {id}")))
    }

    /// Apply a mutation to a record. The mutated copy is persisted before the
    /// cache is updated; readers never observe unpersisted state.
    pub fn update<F>(&self, id: &ContainerId, mutate: F) -> ServinResult<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord),
    {
        let mut inner = self.inner.write();
        let mut record = inner
            .cache
            .get(id)
            .cloned()
            .ok_or_else(|| ServinError::NotFound(format!("container {id}")))?;
        mutate(&mut record);
        inner.store.save(&record)?;
        inner.cache.insert(id.clone(), record.clone());
        Ok(record)
    }

    pub fn update_status(
        &self,
        id: &ContainerId,
        status: ContainerStatus,
    ) -> ServinResult<ContainerRecord> {
        self.update(id, |record| record.status = status)
    }

    pub fn update_pid(&self, id: &ContainerId, pid: u32) -> ServinResult<ContainerRecord> {
        self.update(id, |record| record.pid = pid)
    }

    /// Filtered snapshots, newest first.
    pub fn list(&self, filter: &ContainerFilter) -> Vec<ContainerRecord> {
        let inner = self.inner.read();
        let mut records: Vec<ContainerRecord> = inner
            .cache
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Delete a record from store and cache. Store-first.
    pub fn remove(&self, id: &ContainerId) -> ServinResult<ContainerRecord> {
        let mut inner = self.inner.write();
        if !inner.cache.contains_key(id) {
            return Err(ServinError::NotFound(format!("container {id}")));
        }
        inner.store.remove(id)?;
        let record = inner
            .cache
            .remove(id)
            .ok_or_else(|| ServinError::Internal(format!("cache lost container {id}")))?;
        tracing::debug!(container = %id, "removed container record");
        Ok(record)
    }

    /// True when any live (non-exited) container references the image id.
    pub fn image_in_use(&self, image_ref_or_id: &str) -> bool {
        let inner = self.inner.read();
        inner
            .cache
            .values()
            .any(|r| r.status.is_active() && r.config.image == image_ref_or_id)
    }

    /// True when any container mounts the named volume.
    pub fn volume_in_use(&self, volume_name: &str) -> bool {
        let inner = self.inner.read();
        inner.cache.values().any(|r| {
            r.config
                .mounts
                .iter()
                .any(|m| !m.source.starts_with('/') && m.source == volume_name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::layout::FilesystemLayout;
    use crate::runtime::options::ContainerOptions;
    use tempfile::tempdir;

    fn test_manager() -> (tempfile::TempDir, ContainerManager) {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        (dir, ContainerManager::new(ContainerStore::new(&layout)))
    }

    fn record(name: &str) -> ContainerRecord {
        ContainerRecord::new(ContainerOptions {
            name: name.into(),
            image: "alpine:latest".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_register_and_resolve() {
        let (_dir, manager) = test_manager();
        let r = record("web");
        manager.register(r.clone()).unwrap();

        assert_eq!(manager.resolve("web").unwrap().id, r.id);
        assert_eq!(manager.resolve(&r.id.as_str()[..6]).unwrap().id, r.id);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (_dir, manager) = test_manager();
        manager.register(record("web")).unwrap();
        assert!(matches!(
            manager.register(record("web")),
            Err(ServinError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_update_persists_before_cache() {
        let (dir, manager) = test_manager();
        let r = record("web");
        manager.register(r.clone()).unwrap();
        manager
            .update_status(&r.id, ContainerStatus::Running)
            .unwrap();

        // A fresh store sees the persisted update.
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        let store = ContainerStore::new(&layout);
        assert_eq!(store.load(&r.id).unwrap().status, ContainerStatus::Running);
    }

    #[test]
    fn test_recover_marks_stale_running_as_exited() {
        let (dir, manager) = test_manager();
        let r = record("web");
        manager.register(r.clone()).unwrap();
        manager
            .update(&r.id, |rec| {
                rec.status = ContainerStatus::Running;
                rec.pid = 999_999_998; // certainly dead
            })
            .unwrap();

        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        let fresh = ContainerManager::new(ContainerStore::new(&layout));
        fresh.recover().unwrap();

        let recovered = fresh.get(&r.id).unwrap();
        assert_eq!(recovered.status, ContainerStatus::Exited);
        assert_eq!(recovered.pid, 0);
    }

    #[test]
    fn test_list_filters() {
        let (_dir, manager) = test_manager();
        let a = record("a");
        let b = record("b");
        manager.register(a.clone()).unwrap();
        manager.register(b).unwrap();
        manager
            .update_status(&a.id, ContainerStatus::Running)
            .unwrap();

        let filter = ContainerFilter {
            status: Some(ContainerStatus::Running),
            ..Default::default()
        };
        let running = manager.list(&filter);
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "a");
        assert_eq!(manager.list(&ContainerFilter::default()).len(), 2);
    }

    #[test]
    fn test_remove() {
        let (_dir, manager) = test_manager();
        let r = record("web");
        manager.register(r.clone()).unwrap();
        manager.remove(&r.id).unwrap();
        assert!(matches!(
            manager.resolve("web"),
            Err(ServinError::NotFound(_))
        ));
    }
}
