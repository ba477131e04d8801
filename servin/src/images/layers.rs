//! Layer tar mechanics: applying layers to a directory tree and packing
//! directory contents into deterministic layer tarballs.
//!
//! Whiteout entries (`.wh.<name>`) mark files deleted by a layer, following
//! the conventional image-layer encoding.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;

use crate::errors::{ServinError, ServinResult};

/// Prefix of a whiteout marker entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Reject entry paths that would escape the extraction root.
fn sanitize_entry_path(path: &Path) -> ServinResult<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            other => {
                return Err(ServinError::ImageCorrupt(format!(
                    "layer entry escapes root: {other:?} in {}",
                    path.display()
                )));
            }
        }
    }
    Ok(clean)
}

/// Apply one layer tarball (optionally gzip-compressed) onto `dest`,
/// honouring whiteout markers.
pub fn apply_layer_tar(bytes: &[u8], dest: &Path) -> ServinResult<()> {
    // Gzip magic: 0x1f 0x8b.
    let reader: Box<dyn Read> = if bytes.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(Cursor::new(bytes)))
    } else {
        Box::new(Cursor::new(bytes))
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    for entry in archive
        .entries()
        .map_err(|e| ServinError::ImageCorrupt(format!("unreadable layer: {e}")))?
    {
        let mut entry =
            entry.map_err(|e| ServinError::ImageCorrupt(format!("bad layer entry: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| ServinError::ImageCorrupt(format!("bad entry path: {e}")))?
            .into_owned();
        let rel = sanitize_entry_path(&raw_path)?;

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(victim) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let target = dest.join(rel.parent().unwrap_or(Path::new(""))).join(victim);
            if target.is_dir() {
                std::fs::remove_dir_all(&target).ok();
            } else {
                std::fs::remove_file(&target).ok();
            }
            continue;
        }

        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Permission errors on special entries are non-fatal, matching the
        // lenient extraction the rest of the ecosystem does.
        if let Err(e) = entry.unpack(&target) {
            tracing::debug!(path = %target.display(), error = %e, "skipped layer entry");
        }
    }
    Ok(())
}

/// Pack a set of paths (relative to `root`) into a deterministic layer tar:
/// entries sorted, mtime zeroed, uid/gid zeroed.
pub fn pack_layer(root: &Path, mut rel_paths: Vec<PathBuf>) -> ServinResult<Vec<u8>> {
    rel_paths.sort();
    rel_paths.dedup();

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    for rel in &rel_paths {
        let full = root.join(rel);
        let meta = match std::fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(_) => continue,
        };

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(dir_mode(&meta));
            header.set_cksum();
            builder
                .append_data(&mut header, rel.join(""), std::io::empty())
                .map_err(|e| ServinError::Storage(format!("pack {}: {e}", rel.display())))?;
        } else if meta.file_type().is_symlink() {
            let link = std::fs::read_link(&full)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_cksum();
            builder
                .append_link(&mut header, rel, &link)
                .map_err(|e| ServinError::Storage(format!("pack {}: {e}", rel.display())))?;
        } else if meta.is_file() {
            let bytes = std::fs::read(&full)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(bytes.len() as u64);
            header.set_mode(file_mode(&meta));
            header.set_cksum();
            builder
                .append_data(&mut header, rel, Cursor::new(bytes))
                .map_err(|e| ServinError::Storage(format!("pack {}: {e}", rel.display())))?;
        }
    }

    builder
        .into_inner()
        .map_err(|e| ServinError::Storage(format!("finalize layer: {e}")))
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn dir_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn dir_mode(_meta: &std::fs::Metadata) -> u32 {
    0o755
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pack_then_apply_roundtrip() {
        let src = tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("etc")).unwrap();
        std::fs::write(src.path().join("etc/issue"), b"hello").unwrap();

        let layer = pack_layer(
            src.path(),
            vec![PathBuf::from("etc"), PathBuf::from("etc/issue")],
        )
        .unwrap();

        let dest = tempdir().unwrap();
        apply_layer_tar(&layer, dest.path()).unwrap();
        assert_eq!(
            std::fs::read(dest.path().join("etc/issue")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_pack_is_deterministic() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("a"), b"1").unwrap();
        std::fs::write(src.path().join("b"), b"2").unwrap();
        let paths = vec![PathBuf::from("b"), PathBuf::from("a")];

        let one = pack_layer(src.path(), paths.clone()).unwrap();
        let two = pack_layer(src.path(), paths).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn test_whiteout_removes_file() {
        let dest = tempdir().unwrap();
        std::fs::write(dest.path().join("gone"), b"x").unwrap();

        // Layer containing only a whiteout for "gone".
        let staging = tempdir().unwrap();
        std::fs::write(staging.path().join(".wh.gone"), b"").unwrap();
        let layer = pack_layer(staging.path(), vec![PathBuf::from(".wh.gone")]).unwrap();

        apply_layer_tar(&layer, dest.path()).unwrap();
        assert!(!dest.path().join("gone").exists());
        assert!(!dest.path().join(".wh.gone").exists());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        // Write the escaping path directly into the raw header bytes: the
        // `tar` crate's `set_path`/`append_data` now reject `..` components
        // themselves, but we still want to exercise our own sanitization in
        // `apply_layer_tar` against a malicious archive.
        if let Some(gnu) = header.as_gnu_mut() {
            let name = b"../evil";
            gnu.name[..name.len()].copy_from_slice(name);
        }
        header.set_cksum();
        builder
            .append(&header, Cursor::new(b"hi".to_vec()))
            .unwrap();
        let layer = builder.into_inner().unwrap();

        let dest = tempdir().unwrap();
        assert!(apply_layer_tar(&layer, dest.path()).is_err());
    }
}
