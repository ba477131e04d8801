//! Registry configuration file.
//!
//! `registry-config.json` under the base directory names the local registry
//! port and data directory, known remote registries, per-address credentials
//! and the repositories requiring authentication on the local surface.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ServinResult;
use crate::runtime::layout::FilesystemLayout;
use crate::store::{atomic_write_json, load_json};

pub const CONFIG_FILE: &str = "registry-config.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub local_port: u16,
    pub local_data_dir: PathBuf,
    pub default_registry: String,
    /// Registry name -> address.
    #[serde(default)]
    pub registries: BTreeMap<String, String>,
    /// Address -> credentials.
    #[serde(default)]
    pub credentials: BTreeMap<String, RegistryCredentials>,
    #[serde(default)]
    pub insecure_registries: Vec<String>,
    #[serde(default)]
    pub certificate_dir: Option<PathBuf>,
    /// Local repositories requiring authentication; everything else is
    /// readable anonymously.
    #[serde(default)]
    pub restricted_repositories: Vec<String>,
}

impl RegistryConfig {
    fn defaults_for(layout: &FilesystemLayout) -> Self {
        Self {
            local_port: 5000,
            local_data_dir: layout.registry_dir(),
            default_registry: "docker.io".to_string(),
            registries: BTreeMap::new(),
            credentials: BTreeMap::new(),
            insecure_registries: Vec::new(),
            certificate_dir: None,
            restricted_repositories: Vec::new(),
        }
    }

    fn path(layout: &FilesystemLayout) -> PathBuf {
        layout.base_dir().join(CONFIG_FILE)
    }

    pub fn load(layout: &FilesystemLayout) -> ServinResult<Self> {
        Ok(load_json(&Self::path(layout))?.unwrap_or_else(|| Self::defaults_for(layout)))
    }

    pub fn save(&self, layout: &FilesystemLayout) -> ServinResult<()> {
        atomic_write_json(&Self::path(layout), self)
    }

    /// Record credentials for a registry address (`registry login`).
    pub fn login(
        layout: &FilesystemLayout,
        address: &str,
        credentials: RegistryCredentials,
    ) -> ServinResult<()> {
        let mut config = Self::load(layout)?;
        config.credentials.insert(address.to_string(), credentials);
        config.save(layout)
    }

    /// Drop credentials for a registry address (`registry logout`).
    pub fn logout(layout: &FilesystemLayout, address: &str) -> ServinResult<()> {
        let mut config = Self::load(layout)?;
        config.credentials.remove(address);
        config.save(layout)
    }

    pub fn is_restricted(&self, repository: &str) -> bool {
        self.restricted_repositories
            .iter()
            .any(|r| r == repository)
    }

    /// Check a Basic credential pair against any configured entry.
    pub fn check_basic(&self, username: &str, password: &str) -> bool {
        self.credentials
            .values()
            .any(|c| c.username == username && c.password == password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();

        let config = RegistryConfig::load(&layout).unwrap();
        assert_eq!(config.local_port, 5000);
        assert_eq!(config.default_registry, "docker.io");
        assert!(config.credentials.is_empty());
    }

    #[test]
    fn test_login_logout_cycle() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();

        RegistryConfig::login(
            &layout,
            "localhost:5000",
            RegistryCredentials {
                username: "admin".into(),
                password: "secret".into(),
                email: String::new(),
            },
        )
        .unwrap();

        let config = RegistryConfig::load(&layout).unwrap();
        assert!(config.check_basic("admin", "secret"));
        assert!(!config.check_basic("admin", "wrong"));

        RegistryConfig::logout(&layout, "localhost:5000").unwrap();
        let config = RegistryConfig::load(&layout).unwrap();
        assert!(!config.check_basic("admin", "secret"));
    }

    #[test]
    fn test_restricted_list() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();

        let mut config = RegistryConfig::load(&layout).unwrap();
        config.restricted_repositories.push("private/app".into());
        assert!(config.is_restricted("private/app"));
        assert!(!config.is_restricted("alpine"));
    }
}
