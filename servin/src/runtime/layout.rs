//! On-disk layout of the runtime's base directory.
//!
//! All durable state lives under a single platform-specific root:
//! `/var/lib/servin` on Linux, `~/.servin` elsewhere. The layout is resolved
//! once at runtime construction and never changes afterwards.

use std::path::{Path, PathBuf};

use crate::errors::{ServinError, ServinResult};

/// Resolved directory layout for one runtime instance.
#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    base: PathBuf,
}

impl FilesystemLayout {
    /// Create a layout rooted at `base`. Nothing is touched on disk until
    /// [`prepare`](Self::prepare) is called.
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// Platform default base directory.
    pub fn default_base_dir() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/var/lib/servin")
        }
        #[cfg(not(target_os = "linux"))]
        {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".servin")
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.base.join("containers")
    }

    /// Per-container directory holding `rootfs/`, the two log files and the
    /// persisted record.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    pub fn container_rootfs(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("rootfs")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.base.join("images")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.base.join("volumes")
    }

    pub fn networks_dir(&self) -> PathBuf {
        self.base.join("networks")
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.base.join("sandboxes")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.base.join("registry")
    }

    pub fn vm_dir(&self) -> PathBuf {
        self.base.join("vm")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Create every directory of the layout. Idempotent.
    pub fn prepare(&self) -> ServinResult<()> {
        for dir in [
            self.containers_dir(),
            self.images_dir(),
            self.volumes_dir(),
            self.networks_dir(),
            self.sandboxes_dir(),
            self.registry_dir(),
            self.vm_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                ServinError::Storage(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prepare_creates_all_dirs() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().join("servin"));
        layout.prepare().unwrap();

        assert!(layout.containers_dir().is_dir());
        assert!(layout.images_dir().is_dir());
        assert!(layout.volumes_dir().is_dir());
        assert!(layout.networks_dir().is_dir());
        assert!(layout.vm_dir().is_dir());
    }

    #[test]
    fn test_container_paths_derive_from_id() {
        let layout = FilesystemLayout::new(PathBuf::from("/var/lib/servin"));
        assert_eq!(
            layout.container_rootfs("abc123"),
            PathBuf::from("/var/lib/servin/containers/abc123/rootfs")
        );
    }
}
