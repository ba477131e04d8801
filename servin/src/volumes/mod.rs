//! Volume operations with live-reference protection.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::container::ContainerManager;
use crate::errors::{ServinError, ServinResult};
use crate::store::{VolumeRecord, VolumeStore};

/// Volume surface: the store plus in-use checks against container records.
pub struct VolumeManager {
    store: Arc<VolumeStore>,
    containers: ContainerManager,
}

impl VolumeManager {
    pub fn new(store: Arc<VolumeStore>, containers: ContainerManager) -> Self {
        Self { store, containers }
    }

    pub fn create(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> ServinResult<VolumeRecord> {
        self.store.create(name, labels)
    }

    pub fn inspect(&self, name: &str) -> ServinResult<VolumeRecord> {
        self.store.load(name)
    }

    pub fn list(&self) -> ServinResult<Vec<VolumeRecord>> {
        self.store.list()
    }

    /// Remove a volume; refused while a container references it unless
    /// `force` is set.
    pub fn remove(&self, name: &str, force: bool) -> ServinResult<()> {
        if self.containers.volume_in_use(name) && !force {
            return Err(ServinError::InUse(format!(
                "volume {name} is referenced by a container"
            )));
        }
        self.store.remove(name)
    }

    /// Remove every volume no container references. Returns removed names.
    pub fn prune(&self) -> ServinResult<Vec<String>> {
        let mut removed = Vec::new();
        for record in self.store.list()? {
            if !self.containers.volume_in_use(&record.name) {
                self.store.remove(&record.name)?;
                removed.push(record.name);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::layout::FilesystemLayout;
    use crate::runtime::options::ContainerOptions;
    use crate::runtime::types::{ContainerRecord, MountSpec};
    use crate::store::ContainerStore;
    use tempfile::tempdir;

    fn test_manager() -> (tempfile::TempDir, VolumeManager, ContainerManager) {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        let containers = ContainerManager::new(ContainerStore::new(&layout));
        let volumes = VolumeManager::new(Arc::new(VolumeStore::new(&layout)), containers.clone());
        (dir, volumes, containers)
    }

    #[test]
    fn test_remove_in_use_requires_force() {
        let (_dir, volumes, containers) = test_manager();
        volumes.create("data", BTreeMap::new()).unwrap();

        let record = ContainerRecord::new(ContainerOptions {
            image: "alpine:latest".into(),
            mounts: vec![MountSpec {
                source: "data".into(),
                target: "/data".into(),
                read_only: false,
            }],
            ..Default::default()
        });
        containers.register(record).unwrap();

        assert!(matches!(
            volumes.remove("data", false),
            Err(ServinError::InUse(_))
        ));
        volumes.remove("data", true).unwrap();
    }

    #[test]
    fn test_prune_skips_referenced_volumes() {
        let (_dir, volumes, containers) = test_manager();
        volumes.create("used", BTreeMap::new()).unwrap();
        volumes.create("orphan", BTreeMap::new()).unwrap();

        let record = ContainerRecord::new(ContainerOptions {
            image: "alpine:latest".into(),
            mounts: vec![MountSpec {
                source: "used".into(),
                target: "/data".into(),
                read_only: false,
            }],
            ..Default::default()
        });
        containers.register(record).unwrap();

        let removed = volumes.prune().unwrap();
        assert_eq!(removed, vec!["orphan"]);
        assert!(volumes.inspect("used").is_ok());
    }
}
