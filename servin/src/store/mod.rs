//! Durable state store.
//!
//! One directory per entity kind, one JSON file per record named by id, plus
//! index files mapping names to ids. Every write goes through the tmp+rename
//! idiom so a record is either fully replaced or untouched. Readers tolerate
//! partial scans: a record that fails schema validation is logged and treated
//! as absent.

mod containers;
mod sandboxes;
mod volumes;

pub use containers::ContainerStore;
pub use sandboxes::{PodSandboxRecord, SandboxState, SandboxStore};
pub use volumes::{VolumeRecord, VolumeStore};

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{ServinError, ServinResult};

/// Atomically serialize `value` to `path` (write to a sibling temp file,
/// fsync, rename).
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> ServinResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

/// Atomically write raw bytes to `path`.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> ServinResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ServinError::Storage(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| ServinError::Storage(format!("create {}: {e}", parent.display())))?;

    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)
        .map_err(|e| ServinError::Storage(format!("create {}: {e}", tmp.display())))?;
    file.write_all(bytes)
        .map_err(|e| ServinError::Storage(format!("write {}: {e}", tmp.display())))?;
    file.sync_all()
        .map_err(|e| ServinError::Storage(format!("sync {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| ServinError::Storage(format!("rename into {}: {e}", path.display())))?;
    Ok(())
}

/// Load and deserialize a JSON record. `Ok(None)` when the file is missing;
/// a WARN and `Ok(None)` when the file exists but does not parse.
pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> ServinResult<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ServinError::Storage(format!(
                "read {}: {e}",
                path.display()
            )));
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping corrupt record");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record.json");
        let mut value = BTreeMap::new();
        value.insert("key".to_string(), "value".to_string());

        atomic_write_json(&path, &value).unwrap();
        let back: BTreeMap<String, String> = load_json(&path).unwrap().unwrap();
        assert_eq!(back, value);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_record_reads_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record.json");
        std::fs::write(&path, b"{not json").unwrap();

        let back: Option<BTreeMap<String, String>> = load_json(&path).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn test_missing_record_reads_as_absent() {
        let dir = tempdir().unwrap();
        let back: Option<BTreeMap<String, String>> =
            load_json(&dir.path().join("nope.json")).unwrap();
        assert!(back.is_none());
    }
}
