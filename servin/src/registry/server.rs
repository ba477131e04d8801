//! Registry-v2 HTTP surface.
//!
//! Serves `/v2/` version negotiation, catalog, tag lists, manifests, blobs
//! and chunked upload sessions over the image store, plus `/health` and
//! `/info`. Repository names may contain path separators, so everything
//! under `/v2` is dispatched by hand from a fallback handler rather than a
//! per-segment route table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::errors::{ServinError, ServinResult};
use crate::images::{ImageManifest, ImageStore};
use crate::registry::{RegistryConfig, manifest_digests};

const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const MANIFEST_OCI: &str = "application/vnd.oci.image.manifest.v1+json";
const MAX_BODY: usize = 1024 * 1024 * 1024;

struct UploadSession {
    repository: String,
    path: PathBuf,
}

/// Shared state behind the registry router.
pub struct RegistryServer {
    images: Arc<ImageStore>,
    config: RegistryConfig,
    uploads_dir: PathBuf,
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl RegistryServer {
    pub fn new(images: Arc<ImageStore>, config: RegistryConfig) -> ServinResult<Self> {
        let uploads_dir = config.local_data_dir.join("uploads");
        std::fs::create_dir_all(&uploads_dir)
            .map_err(|e| ServinError::Storage(format!("registry uploads dir: {e}")))?;
        Ok(Self {
            images,
            config,
            uploads_dir,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn port(&self) -> u16 {
        self.config.local_port
    }

    /// Bind and serve until the process exits.
    pub async fn serve(self: Arc<Self>) -> ServinResult<()> {
        let port = self.port();
        let app = registry_router(self);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ServinError::Io(e))?;
        tracing::info!(port, "registry listening");
        axum::serve(listener, app)
            .await
            .map_err(|e| ServinError::Internal(format!("registry server: {e}")))
    }
}

/// Build the registry router over shared state.
pub fn registry_router(state: Arc<RegistryServer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/v2/", get(api_version))
        .route("/v2/_catalog", get(catalog))
        .fallback(dispatch)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

async fn info(State(state): State<Arc<RegistryServer>>) -> impl IntoResponse {
    axum::Json(json!({
        "name": "servin-registry",
        "version": env!("CARGO_PKG_VERSION"),
        "repositories": state.images.repositories().len(),
    }))
}

async fn api_version() -> impl IntoResponse {
    (
        [("Docker-Distribution-Api-Version", "registry/2.0")],
        axum::Json(json!({})),
    )
}

async fn catalog(State(state): State<Arc<RegistryServer>>) -> impl IntoResponse {
    axum::Json(json!({ "repositories": state.images.repositories() }))
}

fn error_body(code: &str, message: &str) -> String {
    json!({ "errors": [{ "code": code, "message": message }] }).to_string()
}

fn registry_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        error_body(code, message),
    )
        .into_response()
}

fn map_error(e: &ServinError) -> Response {
    let status = match e {
        ServinError::NotFound(_) | ServinError::ImageNotFound(_) => StatusCode::NOT_FOUND,
        ServinError::DigestMismatch { .. } | ServinError::ImageCorrupt(_) => {
            StatusCode::BAD_REQUEST
        }
        ServinError::Auth(_) => StatusCode::UNAUTHORIZED,
        ServinError::InUse(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    registry_error(status, &e.kind().to_uppercase().replace('-', "_"), &e.to_string())
}

/// What a `/v2/...` path refers to.
enum V2Target {
    TagsList { name: String },
    Manifest { name: String, reference: String },
    Blob { digest: String },
    UploadStart { name: String },
    UploadSession { uuid: String },
}

fn parse_v2_path(path: &str) -> Option<V2Target> {
    let segments: Vec<&str> = path
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    if segments.first() != Some(&"v2") || segments.len() < 3 {
        return None;
    }
    let rest = &segments[1..];
    let n = rest.len();

    if n >= 3 && rest[n - 2] == "tags" && rest[n - 1] == "list" {
        return Some(V2Target::TagsList {
            name: rest[..n - 2].join("/"),
        });
    }
    if n >= 3 && rest[n - 2] == "manifests" {
        return Some(V2Target::Manifest {
            name: rest[..n - 2].join("/"),
            reference: rest[n - 1].to_string(),
        });
    }
    if n >= 2 && rest[n - 1] == "uploads" && rest[n - 2] == "blobs" {
        return Some(V2Target::UploadStart {
            name: rest[..n - 2].join("/"),
        });
    }
    if n >= 3 && rest[n - 3] == "blobs" && rest[n - 2] == "uploads" {
        return Some(V2Target::UploadSession {
            uuid: rest[n - 1].to_string(),
        });
    }
    if n >= 2 && rest[n - 2] == "blobs" {
        return Some(V2Target::Blob {
            digest: rest[n - 1].to_string(),
        });
    }
    None
}

/// Minimal percent-decoding for digest query values (`sha256%3Aabc`).
fn percent_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next();
            let lo = chars.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                    out.push(byte as char);
                    continue;
                }
            }
            out.push('%');
        } else {
            out.push(c);
        }
    }
    out
}

fn digest_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("digest="))
        .map(percent_decode)
}

/// Basic-auth gate for restricted repositories.
fn authorize(state: &RegistryServer, repository: &str, headers: &header::HeaderMap) -> bool {
    if !state.config.is_restricted(repository) {
        return true;
    }
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    match pair.split_once(':') {
        Some((user, pass)) => state.config.check_basic(user, pass),
        None => false,
    }
}

async fn dispatch(State(state): State<Arc<RegistryServer>>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let headers = request.headers().clone();

    let Some(target) = parse_v2_path(&path) else {
        return registry_error(StatusCode::NOT_FOUND, "UNSUPPORTED", "unknown endpoint");
    };

    // Gate restricted repositories before reading the body.
    let repository = match &target {
        V2Target::TagsList { name }
        | V2Target::Manifest { name, .. }
        | V2Target::UploadStart { name } => Some(name.clone()),
        _ => None,
    };
    if let Some(repository) = &repository {
        if !authorize(&state, repository, &headers) {
            return registry_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "authentication required",
            );
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY).await {
        Ok(body) => body,
        Err(e) => {
            return registry_error(StatusCode::BAD_REQUEST, "BODY", &format!("body read: {e}"));
        }
    };

    match (method, target) {
        (Method::GET, V2Target::TagsList { name }) => {
            let tags = state.images.tags_of(&name);
            if tags.is_empty() {
                return registry_error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", &name);
            }
            axum::Json(json!({ "name": name, "tags": tags })).into_response()
        }
        (Method::GET, V2Target::Manifest { name, reference }) => {
            get_manifest(&state, &name, &reference, true)
        }
        (Method::HEAD, V2Target::Manifest { name, reference }) => {
            get_manifest(&state, &name, &reference, false)
        }
        (Method::PUT, V2Target::Manifest { name, reference }) => {
            put_manifest(&state, &name, &reference, &body)
        }
        (Method::DELETE, V2Target::Manifest { name, reference }) => {
            delete_manifest(&state, &name, &reference)
        }
        (Method::GET, V2Target::Blob { digest }) => get_blob(&state, &digest, true),
        (Method::HEAD, V2Target::Blob { digest }) => get_blob(&state, &digest, false),
        (Method::DELETE, V2Target::Blob { digest }) => {
            let path = state.images.blob_path(&digest);
            match std::fs::remove_file(path) {
                Ok(()) => StatusCode::ACCEPTED.into_response(),
                Err(_) => registry_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", &digest),
            }
        }
        (Method::POST, V2Target::UploadStart { name }) => start_upload(&state, &name),
        (Method::PATCH, V2Target::UploadSession { uuid }) => {
            append_upload(&state, &uuid, &body)
        }
        (Method::PUT, V2Target::UploadSession { uuid }) => {
            let Some(digest) = digest_query(query.as_deref()) else {
                return registry_error(
                    StatusCode::BAD_REQUEST,
                    "DIGEST_INVALID",
                    "missing digest query parameter",
                );
            };
            commit_upload(&state, &uuid, &digest, &body)
        }
        _ => registry_error(StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED", &path),
    }
}

fn resolve_manifest_id(
    state: &RegistryServer,
    name: &str,
    reference: &str,
) -> ServinResult<String> {
    if let Some(hex) = reference.strip_prefix("sha256:") {
        return Ok(hex.to_string());
    }
    state
        .images
        .lookup_tag(name, reference)
        .ok_or_else(|| ServinError::ImageNotFound(format!("{name}:{reference}")))
}

fn get_manifest(state: &RegistryServer, name: &str, reference: &str, with_body: bool) -> Response {
    let id = match resolve_manifest_id(state, name, reference) {
        Ok(id) => id,
        Err(e) => return map_error(&e),
    };
    let bytes = match state.images.manifest_bytes(&id) {
        Ok(bytes) => bytes,
        Err(e) => return map_error(&e),
    };
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MANIFEST_V2)
        .header("Docker-Content-Digest", format!("sha256:{id}"))
        .header(header::CONTENT_LENGTH, bytes.len());
    if !with_body {
        builder = builder.header("X-Content-Head", "true");
    }
    let body = if with_body { Body::from(bytes) } else { Body::empty() };
    builder.body(body).unwrap_or_else(|_| {
        registry_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "response build")
    })
}

fn put_manifest(state: &RegistryServer, name: &str, reference: &str, body: &[u8]) -> Response {
    let (config_digest, layer_digests) = match manifest_digests(body) {
        Ok(parsed) => parsed,
        Err(e) => return map_error(&e),
    };

    for digest in layer_digests.iter().chain(std::iter::once(&config_digest)) {
        if !state.images.has_blob(digest) {
            return registry_error(StatusCode::BAD_REQUEST, "MANIFEST_BLOB_UNKNOWN", digest);
        }
    }

    let size: u64 = layer_digests
        .iter()
        .filter_map(|d| state.images.blob_path(d).metadata().ok())
        .map(|m| m.len())
        .sum();

    let manifest = ImageManifest::new(config_digest, layer_digests);
    let tags = if reference.starts_with("sha256:") {
        Vec::new()
    } else {
        vec![format!("{name}:{reference}")]
    };
    match state.images.register_image(&manifest, size, &tags) {
        Ok(record) => (
            StatusCode::CREATED,
            [
                ("Docker-Content-Digest", format!("sha256:{}", record.id)),
                (
                    "Location",
                    format!("/v2/{name}/manifests/sha256:{}", record.id),
                ),
            ],
        )
            .into_response(),
        Err(e) => map_error(&e),
    }
}

fn delete_manifest(state: &RegistryServer, name: &str, reference: &str) -> Response {
    let target = if reference.starts_with("sha256:") {
        reference.trim_start_matches("sha256:").to_string()
    } else {
        format!("{name}:{reference}")
    };
    match state.images.remove(&target, false, false) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => map_error(&e),
    }
}

fn get_blob(state: &RegistryServer, digest: &str, with_body: bool) -> Response {
    let path = state.images.blob_path(digest);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(_) => return registry_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", digest),
    };
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("Docker-Content-Digest", digest)
        .header(header::CONTENT_LENGTH, bytes.len());
    if !with_body {
        builder = builder.header("X-Content-Head", "true");
    }
    let body = if with_body { Body::from(bytes) } else { Body::empty() };
    builder.body(body).unwrap_or_else(|_| {
        registry_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "response build")
    })
}

fn start_upload(state: &RegistryServer, name: &str) -> Response {
    let mut uuid_bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::rng(), &mut uuid_bytes);
    let uuid = hex::encode(uuid_bytes);

    let path = state.uploads_dir.join(&uuid);
    if let Err(e) = std::fs::write(&path, b"") {
        return registry_error(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE", &e.to_string());
    }
    state.sessions.lock().insert(
        uuid.clone(),
        UploadSession {
            repository: name.to_string(),
            path,
        },
    );

    (
        StatusCode::ACCEPTED,
        [
            ("Location", format!("/v2/{name}/blobs/uploads/{uuid}")),
            ("Docker-Upload-UUID", uuid),
            ("Range", "0-0".to_string()),
        ],
    )
        .into_response()
}

fn append_upload(state: &RegistryServer, uuid: &str, body: &[u8]) -> Response {
    let path = {
        let sessions = state.sessions.lock();
        match sessions.get(uuid) {
            Some(session) => session.path.clone(),
            None => {
                return registry_error(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", uuid);
            }
        }
    };

    use std::io::Write;
    let result = std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .and_then(|mut file| file.write_all(body).map(|()| file))
        .and_then(|file| file.metadata());
    match result {
        Ok(meta) => {
            let end = meta.len().saturating_sub(1);
            (
                StatusCode::ACCEPTED,
                [
                    ("Docker-Upload-UUID", uuid.to_string()),
                    ("Range", format!("0-{end}")),
                ],
            )
                .into_response()
        }
        Err(e) => registry_error(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE", &e.to_string()),
    }
}

fn commit_upload(state: &RegistryServer, uuid: &str, digest: &str, body: &[u8]) -> Response {
    let (repository, path) = {
        let mut sessions = state.sessions.lock();
        match sessions.remove(uuid) {
            Some(session) => (session.repository, session.path),
            None => {
                return registry_error(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", uuid);
            }
        }
    };

    // Final chunk may arrive with the commit.
    if !body.is_empty() {
        use std::io::Write;
        let appended = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(body));
        if let Err(e) = appended {
            return registry_error(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE", &e.to_string());
        }
    }

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            return registry_error(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE", &e.to_string());
        }
    };
    let actual = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
    if actual != digest {
        std::fs::remove_file(&path).ok();
        let e = ServinError::DigestMismatch {
            expected: digest.to_string(),
            actual,
        };
        return map_error(&e);
    }

    let stored = state.images.put_blob(&bytes);
    std::fs::remove_file(&path).ok();
    match stored {
        Ok(stored_digest) => (
            StatusCode::CREATED,
            [
                ("Docker-Content-Digest", stored_digest.clone()),
                ("Location", format!("/v2/{repository}/blobs/{stored_digest}")),
            ],
        )
            .into_response(),
        Err(e) => map_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v2_paths() {
        assert!(matches!(
            parse_v2_path("/v2/alpine/tags/list"),
            Some(V2Target::TagsList { name }) if name == "alpine"
        ));
        assert!(matches!(
            parse_v2_path("/v2/team/app/tags/list"),
            Some(V2Target::TagsList { name }) if name == "team/app"
        ));
        assert!(matches!(
            parse_v2_path("/v2/team/app/manifests/latest"),
            Some(V2Target::Manifest { name, reference })
                if name == "team/app" && reference == "latest"
        ));
        assert!(matches!(
            parse_v2_path("/v2/alpine/blobs/uploads/"),
            Some(V2Target::UploadStart { name }) if name == "alpine"
        ));
        assert!(matches!(
            parse_v2_path("/v2/alpine/blobs/uploads/abc123"),
            Some(V2Target::UploadSession { uuid }) if uuid == "abc123"
        ));
        assert!(matches!(
            parse_v2_path("/v2/alpine/blobs/sha256:abc"),
            Some(V2Target::Blob { digest }) if digest == "sha256:abc"
        ));
        assert!(parse_v2_path("/v1/whatever").is_none());
    }

    #[test]
    fn test_percent_decode_digest() {
        assert_eq!(percent_decode("sha256%3Aabc"), "sha256:abc");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(
            digest_query(Some("digest=sha256%3Adeadbeef")).unwrap(),
            "sha256:deadbeef"
        );
        assert!(digest_query(Some("other=1")).is_none());
    }
}
