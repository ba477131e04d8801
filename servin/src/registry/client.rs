//! Registry-v2 client used for image pull and push.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::errors::{ServinError, ServinResult};
use crate::images::{ImageManifest, ImageRecord, ImageReference, ImageStore};
use crate::registry::{RegistryConfig, manifest_digests};

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
                               application/vnd.oci.image.manifest.v1+json";
const BLOB_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client against one registry address.
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<(String, String)>,
}

impl RegistryClient {
    /// Build a client for `address` (`host[:port]`), picking up credentials
    /// and the insecure list from the registry configuration.
    pub fn for_address(address: &str, config: &RegistryConfig) -> ServinResult<Self> {
        let scheme = if config.insecure_registries.iter().any(|r| r == address) {
            "http"
        } else {
            "https"
        };
        let http = reqwest::Client::builder()
            .timeout(BLOB_TIMEOUT)
            .build()
            .map_err(|e| ServinError::Internal(format!("http client: {e}")))?;
        let auth = config
            .credentials
            .get(address)
            .map(|c| (c.username.clone(), c.password.clone()));
        Ok(Self {
            http,
            base_url: format!("{scheme}://{address}"),
            auth,
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some((user, pass)) = &self.auth {
            let token =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            builder = builder.header("Authorization", format!("Basic {token}"));
        }
        builder
    }

    async fn get_bytes(&self, url: String, accept: Option<&str>) -> ServinResult<Vec<u8>> {
        let mut builder = self.request(reqwest::Method::GET, url.clone());
        if let Some(accept) = accept {
            builder = builder.header("Accept", accept);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ServinError::Io(std::io::Error::other(format!("{url}: {e}"))))?;
        match response.status().as_u16() {
            200 => {}
            401 | 403 => {
                return Err(ServinError::Auth(format!("{url}: {}", response.status())));
            }
            404 => return Err(ServinError::ImageNotFound(url)),
            code => {
                return Err(ServinError::Io(std::io::Error::other(format!(
                    "{url}: HTTP {code}"
                ))));
            }
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ServinError::Io(std::io::Error::other(format!("{url}: {e}"))))
    }

    /// Pull `reference` into the local image store, verifying every blob
    /// digest on the way in.
    pub async fn pull(
        &self,
        images: &Arc<ImageStore>,
        reference: &ImageReference,
    ) -> ServinResult<ImageRecord> {
        tracing::info!(image = %reference, registry = %self.base_url, "pulling image");

        let manifest_url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, reference.name, reference.tag
        );
        let manifest_bytes = self.get_bytes(manifest_url, Some(MANIFEST_ACCEPT)).await?;
        let (config_digest, layer_digests) = manifest_digests(&manifest_bytes)?;

        let mut total_size = 0u64;
        for digest in layer_digests.iter().chain(std::iter::once(&config_digest)) {
            if images.has_blob(digest) {
                continue;
            }
            let url = format!("{}/v2/{}/blobs/{digest}", self.base_url, reference.name);
            let bytes = self.get_bytes(url, None).await?;

            let actual = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
            if &actual != digest {
                return Err(ServinError::DigestMismatch {
                    expected: digest.clone(),
                    actual,
                });
            }
            if digest != &config_digest {
                total_size += bytes.len() as u64;
            }
            images.put_blob(&bytes)?;
        }

        let manifest = ImageManifest::new(config_digest, layer_digests);
        images.register_image(&manifest, total_size, &[reference.canonical()])
    }

    async fn upload_blob(&self, name: &str, digest: &str, bytes: Vec<u8>) -> ServinResult<()> {
        let start_url = format!("{}/v2/{name}/blobs/uploads/", self.base_url);
        let response = self
            .request(reqwest::Method::POST, start_url.clone())
            .send()
            .await
            .map_err(|e| ServinError::Io(std::io::Error::other(format!("{start_url}: {e}"))))?;
        if response.status().as_u16() == 401 {
            return Err(ServinError::Auth(format!("{start_url}: unauthorized")));
        }
        let location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ServinError::Io(std::io::Error::other("upload start returned no location"))
            })?
            .to_string();

        let commit_url = if location.starts_with("http") {
            format!("{location}?digest={digest}")
        } else {
            format!("{}{location}?digest={digest}", self.base_url)
        };
        let response = self
            .request(reqwest::Method::PUT, commit_url.clone())
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| ServinError::Io(std::io::Error::other(format!("{commit_url}: {e}"))))?;
        if !response.status().is_success() {
            return Err(ServinError::Io(std::io::Error::other(format!(
                "blob upload failed: HTTP {}",
                response.status()
            ))));
        }
        Ok(())
    }

    /// Push a locally stored image to the registry.
    pub async fn push(
        &self,
        images: &Arc<ImageStore>,
        reference: &ImageReference,
    ) -> ServinResult<()> {
        tracing::info!(image = %reference, registry = %self.base_url, "pushing image");

        let record = images.inspect(&reference.canonical())?;
        let manifest = images.load_manifest(&record.id)?;

        for digest in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
            let bytes = images.read_blob(digest)?;
            self.upload_blob(&reference.name, digest, bytes).await?;
        }

        let manifest_url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, reference.name, reference.tag
        );
        let response = self
            .request(reqwest::Method::PUT, manifest_url.clone())
            .header(
                "Content-Type",
                "application/vnd.docker.distribution.manifest.v2+json",
            )
            .body(manifest.canonical_bytes())
            .send()
            .await
            .map_err(|e| ServinError::Io(std::io::Error::other(format!("{manifest_url}: {e}"))))?;
        if !response.status().is_success() {
            return Err(ServinError::Io(std::io::Error::other(format!(
                "manifest upload failed: HTTP {}",
                response.status()
            ))));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::layout::FilesystemLayout;
    use tempfile::tempdir;

    #[test]
    fn test_insecure_registries_use_http() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();

        let mut config = RegistryConfig::load(&layout).unwrap();
        config.insecure_registries.push("localhost:5000".into());

        let client = RegistryClient::for_address("localhost:5000", &config).unwrap();
        assert!(client.base_url.starts_with("http://"));

        let secure = RegistryClient::for_address("ghcr.io", &config).unwrap();
        assert!(secure.base_url.starts_with("https://"));
    }
}
