//! Shared fixtures for integration tests.

use servin::{ServinOptions, ServinRuntime};
use sha2::{Digest, Sha256};

/// Build a minimal, valid image tarball: one layer carrying `/hello`, a
/// config with a default command, and a `manifest.json` naming both.
pub fn sample_image_tarball(repo_tag: &str) -> Vec<u8> {
    // Inner layer tar.
    let mut layer_builder = tar::Builder::new(Vec::new());
    append(&mut layer_builder, "hello", b"hi from the layer");
    let layer_bytes = layer_builder.into_inner().unwrap();
    let layer_id = hex::encode(Sha256::digest(&layer_bytes));

    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Cmd": ["/bin/echo", "Hello"],
            "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"]
        }
    });
    let config_bytes = serde_json::to_vec(&config).unwrap();

    let manifest = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": [repo_tag],
        "Layers": [format!("{layer_id}/layer.tar")]
    }]);
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, "manifest.json", &manifest_bytes);
    append(&mut builder, "config.json", &config_bytes);
    append(&mut builder, &format!("{layer_id}/layer.tar"), &layer_bytes);
    builder.into_inner().unwrap()
}

fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, bytes: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, bytes).unwrap();
}

/// A runtime rooted in a fresh temp directory, native backend only.
pub fn test_runtime() -> (tempfile::TempDir, ServinRuntime) {
    let dir = tempfile::tempdir().unwrap();
    let runtime = ServinRuntime::new(ServinOptions {
        base_dir: dir.path().to_path_buf(),
        vm_mode: Some(false),
        ..Default::default()
    })
    .unwrap();
    (dir, runtime)
}
