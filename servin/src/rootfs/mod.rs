//! Container root filesystem materialization.
//!
//! For a container id and a resolved image, the builder creates
//! `<base>/containers/<id>/rootfs`, extracts the image layers in order
//! (lower layers first), injects `/etc/hostname` and `/etc/resolv.conf`, and
//! pre-creates bind-mount targets. Teardown unmounts lazily and removes the
//! directory; it is idempotent and failures are logged, not fatal.

use std::path::{Path, PathBuf};

use crate::errors::{ServinError, ServinResult};
use crate::images::{ImageStore, apply_layer_tar};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::types::MountSpec;

/// Nameservers written into the container's resolv.conf.
const DEFAULT_NAMESERVERS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];

/// Materializes and tears down per-container root filesystems.
pub struct RootfsBuilder {
    layout: FilesystemLayout,
}

impl RootfsBuilder {
    pub fn new(layout: FilesystemLayout) -> Self {
        Self { layout }
    }

    /// The deterministic rootfs path for a container id.
    pub fn rootfs_path(&self, container_id: &str) -> PathBuf {
        self.layout.container_rootfs(container_id)
    }

    /// Build the rootfs for a container from an image id.
    pub fn prepare(
        &self,
        container_id: &str,
        image_id: &str,
        images: &ImageStore,
        hostname: &str,
        mounts: &[MountSpec],
    ) -> ServinResult<PathBuf> {
        let rootfs = self.rootfs_path(container_id);
        std::fs::create_dir_all(&rootfs)
            .map_err(|e| ServinError::Storage(format!("create {}: {e}", rootfs.display())))?;

        let manifest = images.load_manifest(image_id)?;
        for layer in &manifest.layers {
            let bytes = images.read_blob(layer)?;
            apply_layer_tar(&bytes, &rootfs)?;
        }

        self.inject_etc(&rootfs, hostname)?;

        // Bind-mount targets must exist before the init process mounts over
        // them.
        for mount in mounts {
            let target = rootfs.join(mount.target.trim_start_matches('/'));
            std::fs::create_dir_all(&target).map_err(|e| {
                ServinError::Storage(format!("mount target {}: {e}", target.display()))
            })?;
        }

        tracing::debug!(container = container_id, layers = manifest.layers.len(), "rootfs prepared");
        Ok(rootfs)
    }

    fn inject_etc(&self, rootfs: &Path, hostname: &str) -> ServinResult<()> {
        let etc = rootfs.join("etc");
        std::fs::create_dir_all(&etc)?;
        std::fs::write(etc.join("hostname"), format!("{hostname}\n"))?;

        let mut resolv = String::new();
        for ns in DEFAULT_NAMESERVERS {
            resolv.push_str(&format!("nameserver {ns}\n"));
        }
        std::fs::write(etc.join("resolv.conf"), resolv)?;

        let hosts = format!("127.0.0.1\tlocalhost\n127.0.1.1\t{hostname}\n");
        std::fs::write(etc.join("hosts"), hosts)?;
        Ok(())
    }

    /// Tear down a container's rootfs: lazy-unmount anything still mounted
    /// under it (bottom-up), then remove the directory. Idempotent.
    pub fn teardown(&self, container_id: &str) {
        let rootfs = self.rootfs_path(container_id);
        if !rootfs.exists() {
            return;
        }

        #[cfg(target_os = "linux")]
        unmount_below(&rootfs);

        if let Err(e) = std::fs::remove_dir_all(&rootfs) {
            tracing::warn!(
                container = container_id,
                path = %rootfs.display(),
                error = %e,
                "rootfs removal incomplete"
            );
        }
    }
}

/// Lazily detach every mount point under `root`, deepest first.
#[cfg(target_os = "linux")]
fn unmount_below(root: &Path) {
    let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
        return;
    };
    let root_str = root.to_string_lossy();
    let mut targets: Vec<&str> = mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|target| target.starts_with(root_str.as_ref()))
        .collect();
    // Deepest first so nested mounts release before their parents.
    targets.sort_by_key(|t| std::cmp::Reverse(t.len()));

    for target in targets {
        if let Err(e) = nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH) {
            tracing::debug!(target, error = %e, "lazy unmount failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::{ImageConfigBlob, ImageManifest, RuntimeDefaults};
    use tempfile::tempdir;

    fn store_with_image(layout: &FilesystemLayout) -> (ImageStore, String) {
        let store = ImageStore::open(layout).unwrap();

        let staging = tempdir().unwrap();
        std::fs::create_dir_all(staging.path().join("bin")).unwrap();
        std::fs::write(staging.path().join("bin/sh"), b"#!shell").unwrap();
        let layer = crate::images::pack_layer(
            staging.path(),
            vec![PathBuf::from("bin"), PathBuf::from("bin/sh")],
        )
        .unwrap();

        let layer_digest = store.put_blob(&layer).unwrap();
        let config =
            serde_json::to_vec(&ImageConfigBlob::new(RuntimeDefaults::default())).unwrap();
        let config_digest = store.put_blob(&config).unwrap();
        let manifest = ImageManifest::new(config_digest, vec![layer_digest]);
        let record = store
            .register_image(&manifest, layer.len() as u64, &["base:latest".into()])
            .unwrap();
        (store, record.id)
    }

    #[test]
    fn test_prepare_materializes_layers_and_etc() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        let (store, image_id) = store_with_image(&layout);

        let builder = RootfsBuilder::new(layout);
        let mounts = vec![MountSpec {
            source: "/tmp/host".into(),
            target: "/data".into(),
            read_only: false,
        }];
        let rootfs = builder
            .prepare("c1", &image_id, &store, "web-1", &mounts)
            .unwrap();

        assert!(rootfs.join("bin/sh").is_file());
        assert_eq!(
            std::fs::read_to_string(rootfs.join("etc/hostname")).unwrap(),
            "web-1\n"
        );
        assert!(
            std::fs::read_to_string(rootfs.join("etc/resolv.conf"))
                .unwrap()
                .contains("nameserver")
        );
        assert!(rootfs.join("data").is_dir());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        let (store, image_id) = store_with_image(&layout);

        let builder = RootfsBuilder::new(layout);
        builder
            .prepare("c1", &image_id, &store, "c1", &[])
            .unwrap();

        builder.teardown("c1");
        assert!(!builder.rootfs_path("c1").exists());
        // Second call is a no-op.
        builder.teardown("c1");
    }
}
