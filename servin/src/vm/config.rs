//! VM guest configuration and mode detection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ServinResult;
use crate::runtime::layout::FilesystemLayout;
use crate::store::{atomic_write_json, load_json};

/// Guest distribution flavours with known cloud images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmDistro {
    #[default]
    Alpine,
    Ubuntu,
    Debian,
}

/// Virtualization provider driving the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmProvider {
    Kvm,
    Qemu,
    Hvf,
    Hyperv,
    Vbox,
    Wsl2,
}

impl VmProvider {
    /// Platform default: hardware acceleration when the host offers it,
    /// plain qemu otherwise.
    pub fn platform_default() -> Self {
        #[cfg(target_os = "linux")]
        {
            if std::path::Path::new("/dev/kvm").exists() {
                Self::Kvm
            } else {
                Self::Qemu
            }
        }
        #[cfg(target_os = "macos")]
        {
            Self::Hvf
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            Self::Hyperv
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kvm => "kvm",
            Self::Qemu => "qemu",
            Self::Hvf => "hvf",
            Self::Hyperv => "hyperv",
            Self::Vbox => "vbox",
            Self::Wsl2 => "wsl2",
        }
    }
}

/// Guest configuration, persisted at `<base>/vm/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    pub distro: VmDistro,
    /// Host port forwarded to guest port 22.
    pub ssh_port: u16,
    /// Host port forwarded to the guest's dockerd-compatible socket.
    pub docker_port: u16,
    pub provider: VmProvider,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "servin-vm".to_string(),
            cpus: 2,
            memory_mb: 2048,
            disk_gb: 16,
            distro: VmDistro::default(),
            ssh_port: 2222,
            docker_port: 2375,
            provider: VmProvider::platform_default(),
        }
    }
}

impl VmConfig {
    pub fn config_path(layout: &FilesystemLayout) -> PathBuf {
        layout.vm_dir().join("config.json")
    }

    /// Load the persisted config, falling back to defaults.
    pub fn load(layout: &FilesystemLayout) -> ServinResult<Self> {
        Ok(load_json(&Self::config_path(layout))?.unwrap_or_default())
    }

    pub fn save(&self, layout: &FilesystemLayout) -> ServinResult<()> {
        atomic_write_json(&Self::config_path(layout), self)
    }
}

/// Whether container operations should run through the VM guest.
///
/// Enabled by explicit opt-in (`SERVIN_VM_MODE=true|1`), the presence of a
/// VM configuration file, or automatically on hosts without native Linux
/// namespaces.
pub fn vm_mode_enabled(layout: &FilesystemLayout) -> bool {
    match std::env::var("SERVIN_VM_MODE") {
        Ok(v) if v == "1" || v.eq_ignore_ascii_case("true") => return true,
        Ok(v) if v == "0" || v.eq_ignore_ascii_case("false") => return false,
        _ => {}
    }
    if VmConfig::config_path(layout).exists() {
        return true;
    }
    !cfg!(target_os = "linux")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.name, "servin-vm");
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.distro, VmDistro::Alpine);
    }

    #[test]
    fn test_load_save_roundtrip() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();

        let mut config = VmConfig::load(&layout).unwrap();
        config.cpus = 8;
        config.save(&layout).unwrap();

        let back = VmConfig::load(&layout).unwrap();
        assert_eq!(back.cpus, 8);
    }

    #[test]
    fn test_config_file_enables_vm_mode() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();

        VmConfig::default().save(&layout).unwrap();
        assert!(vm_mode_enabled(&layout));
    }
}
