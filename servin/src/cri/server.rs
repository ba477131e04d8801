//! CRI HTTP server.
//!
//! Maps pod sandbox and container verbs onto the engine and image verbs onto
//! the image store. The server itself is a stateless translator: the only
//! thing it owns is the sandbox-id to network-mode mapping, and that is
//! persisted as pod sandbox records.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use rand::Rng;

use crate::container::ContainerFilter;
use crate::errors::{ServinError, ServinResult};
use crate::images::{ImageReference, ImageStore};
use crate::registry::{RegistryClient, RegistryConfig};
use crate::runtime::backend::ContainerRuntime;
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::ContainerOptions;
use crate::runtime::types::{ContainerRecord, ContainerStatus, MountSpec, NetworkMode};
use crate::store::{PodSandboxRecord, SandboxState, SandboxStore};

use super::types::*;

pub const DEFAULT_CRI_PORT: u16 = 8080;

const RUNTIME_NAME: &str = "servin";
const API_VERSION: &str = "v1alpha2";

/// Shared state behind the CRI router.
pub struct CriServer {
    runtime: Arc<dyn ContainerRuntime>,
    images: Arc<ImageStore>,
    sandboxes: Arc<SandboxStore>,
    layout: FilesystemLayout,
    port: u16,
}

impl CriServer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        images: Arc<ImageStore>,
        sandboxes: Arc<SandboxStore>,
        layout: FilesystemLayout,
        port: u16,
    ) -> Self {
        Self {
            runtime,
            images,
            sandboxes,
            layout,
            port,
        }
    }

    pub async fn serve(self: Arc<Self>) -> ServinResult<()> {
        let port = self.port;
        let app = cri_router(self);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(ServinError::Io)?;
        tracing::info!(port, "CRI server listening");
        axum::serve(listener, app)
            .await
            .map_err(|e| ServinError::Internal(format!("cri server: {e}")))
    }
}

/// Build the CRI router.
pub fn cri_router(state: Arc<CriServer>) -> Router {
    Router::new()
        .route("/v1/runtime/version", get(version).post(version))
        .route("/v1/runtime/status", get(status).post(status))
        .route("/v1/runtime/sandbox/create", post(run_sandbox))
        .route("/v1/runtime/sandbox/stop", post(stop_sandbox))
        .route("/v1/runtime/sandbox/remove", post(remove_sandbox))
        .route("/v1/runtime/sandbox/status", post(sandbox_status))
        .route("/v1/runtime/sandbox/list", post(list_sandboxes))
        .route("/v1/runtime/container/create", post(create_container))
        .route("/v1/runtime/container/start", post(start_container))
        .route("/v1/runtime/container/stop", post(stop_container))
        .route("/v1/runtime/container/remove", post(remove_container))
        .route("/v1/runtime/container/status", post(container_status))
        .route("/v1/runtime/container/list", post(list_containers))
        .route("/v1/runtime/exec-sync", post(exec_sync))
        .route("/v1/image/list", post(list_images).get(list_images))
        .route("/v1/image/status", post(image_status))
        .route("/v1/image/pull", post(pull_image))
        .route("/v1/image/remove", post(remove_image))
        .route("/v1/image/fs-info", post(image_fs_info).get(image_fs_info))
        .with_state(state)
}

/// Engine errors surface as CRI status codes with preserved reason strings.
fn cri_error(e: ServinError) -> Response {
    let (status, reason) = match &e {
        ServinError::NotFound(_) | ServinError::ImageNotFound(_) => {
            (StatusCode::NOT_FOUND, "not-found")
        }
        ServinError::Isolation(_) | ServinError::InUse(_) => {
            (StatusCode::PRECONDITION_FAILED, "failed-precondition")
        }
        ServinError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "deadline-exceeded"),
        ServinError::InvalidConfig(_) | ServinError::Ambiguous(_) => {
            (StatusCode::BAD_REQUEST, "invalid-argument")
        }
        ServinError::AlreadyExists(_) | ServinError::AlreadyRunning(_) => {
            (StatusCode::CONFLICT, "already-exists")
        }
        ServinError::NotRunning(_) => (StatusCode::PRECONDITION_FAILED, "failed-precondition"),
        ServinError::VmUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        ServinError::Auth(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(CriError {
            code: e.kind().to_string(),
            reason: reason.to_string(),
            message: e.to_string(),
        }),
    )
        .into_response()
}

fn ok<T: serde::Serialize>(value: T) -> Response {
    Json(value).into_response()
}

fn nanos(ts: Option<chrono::DateTime<Utc>>) -> i64 {
    ts.and_then(|t| t.timestamp_nanos_opt()).unwrap_or(0)
}

fn state_string(status: ContainerStatus) -> &'static str {
    match status {
        ContainerStatus::Created => "CONTAINER_CREATED",
        ContainerStatus::Running | ContainerStatus::Paused => "CONTAINER_RUNNING",
        ContainerStatus::Exited => "CONTAINER_EXITED",
        ContainerStatus::Removed => "CONTAINER_UNKNOWN",
    }
}

fn to_cri_container(record: &ContainerRecord) -> CriContainer {
    CriContainer {
        id: record.id.as_str().to_string(),
        pod_sandbox_id: record.sandbox_id.clone().unwrap_or_default(),
        metadata: ContainerMetadata {
            name: record.name.clone(),
            attempt: 0,
        },
        image: ImageSpec {
            image: record.config.image.clone(),
        },
        image_ref: record.config.image.clone(),
        state: state_string(record.status).to_string(),
        created_at: nanos(Some(record.created_at)),
        labels: record.labels().clone(),
    }
}

// ----------------------------------------------------------------------
// Runtime service
// ----------------------------------------------------------------------

async fn version() -> Response {
    ok(VersionResponse {
        version: "0.1.0".to_string(),
        runtime_name: RUNTIME_NAME.to_string(),
        runtime_version: env!("CARGO_PKG_VERSION").to_string(),
        runtime_api_version: API_VERSION.to_string(),
    })
}

async fn status() -> Response {
    ok(StatusResponse {
        conditions: vec![
            RuntimeCondition {
                r#type: "RuntimeReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
            RuntimeCondition {
                r#type: "NetworkReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
        ],
    })
}

// ----------------------------------------------------------------------
// Pod sandboxes
// ----------------------------------------------------------------------

fn sandbox_to_wire(record: &PodSandboxRecord) -> PodSandbox {
    PodSandbox {
        id: record.id.clone(),
        metadata: PodSandboxMetadata {
            name: record.name.clone(),
            uid: record.uid.clone(),
            namespace: record.namespace.clone(),
            attempt: record.attempt,
        },
        state: match record.state {
            SandboxState::Ready => "SANDBOX_READY".to_string(),
            SandboxState::NotReady => "SANDBOX_NOTREADY".to_string(),
        },
        created_at: nanos(Some(record.created_at)),
        labels: record.labels.clone(),
        annotations: record.annotations.clone(),
    }
}

async fn run_sandbox(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<RunPodSandboxRequest>,
) -> Response {
    // Sandbox identity: 16 random bytes, hex-rendered.
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    let id = hex::encode(bytes);

    let host_network = request
        .config
        .linux
        .as_ref()
        .and_then(|l| l.security_context.as_ref())
        .and_then(|sc| sc.namespace_options.as_ref())
        .map(|ns| ns.network.eq_ignore_ascii_case("NODE"))
        .unwrap_or(false);

    let record = PodSandboxRecord {
        id: id.clone(),
        name: request.config.metadata.name,
        namespace: request.config.metadata.namespace,
        uid: request.config.metadata.uid,
        attempt: request.config.metadata.attempt,
        labels: request.config.labels,
        annotations: request.config.annotations,
        log_directory: request.config.log_directory,
        state: SandboxState::Ready,
        network_mode: if host_network {
            NetworkMode::Host
        } else {
            NetworkMode::Bridge
        },
        created_at: Utc::now(),
    };
    if let Err(e) = state.sandboxes.save(&record) {
        return cri_error(e);
    }
    tracing::info!(sandbox = %id, name = %record.name, "sandbox created");
    ok(RunPodSandboxResponse { pod_sandbox_id: id })
}

async fn stop_sandbox(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<PodSandboxIdRequest>,
) -> Response {
    let filter = ContainerFilter {
        sandbox_id: Some(request.pod_sandbox_id.clone()),
        ..Default::default()
    };
    let containers = match state.runtime.list(&filter).await {
        Ok(containers) => containers,
        Err(e) => return cri_error(e),
    };
    for container in containers {
        if container.status == ContainerStatus::Running {
            if let Err(e) = state
                .runtime
                .stop(container.id.as_str(), Some(Duration::from_secs(10)))
                .await
            {
                tracing::warn!(container = %container.id, error = %e, "sandbox stop: container stop failed");
            }
        }
    }
    match state
        .sandboxes
        .update_state(&request.pod_sandbox_id, SandboxState::NotReady)
    {
        Ok(()) => ok(serde_json::json!({})),
        Err(e) => cri_error(e),
    }
}

async fn remove_sandbox(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<PodSandboxIdRequest>,
) -> Response {
    // Containers in the sandbox go first; none may outlive it.
    let filter = ContainerFilter {
        sandbox_id: Some(request.pod_sandbox_id.clone()),
        ..Default::default()
    };
    let containers = match state.runtime.list(&filter).await {
        Ok(containers) => containers,
        Err(e) => return cri_error(e),
    };
    for container in containers {
        if let Err(e) = state.runtime.remove(container.id.as_str(), true).await {
            return cri_error(e);
        }
    }
    match state.sandboxes.remove(&request.pod_sandbox_id) {
        Ok(()) => ok(serde_json::json!({})),
        Err(e) => cri_error(e),
    }
}

async fn sandbox_status(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<PodSandboxIdRequest>,
) -> Response {
    match state.sandboxes.load(&request.pod_sandbox_id) {
        Ok(record) => ok(PodSandboxStatusResponse {
            status: sandbox_to_wire(&record),
        }),
        Err(e) => cri_error(e),
    }
}

async fn list_sandboxes(
    State(state): State<Arc<CriServer>>,
    request: Option<Json<ListPodSandboxRequest>>,
) -> Response {
    let filter = request.and_then(|Json(r)| r.filter).unwrap_or_default();
    let records = match state.sandboxes.list() {
        Ok(records) => records,
        Err(e) => return cri_error(e),
    };
    let items: Vec<PodSandbox> = records
        .iter()
        .filter(|r| filter.id.as_deref().is_none_or(|id| id == r.id))
        .filter(|r| {
            filter
                .label_selector
                .iter()
                .all(|(k, v)| r.labels.get(k) == Some(v))
        })
        .map(sandbox_to_wire)
        .collect();
    ok(ListPodSandboxResponse { items })
}

// ----------------------------------------------------------------------
// Containers
// ----------------------------------------------------------------------

async fn create_container(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<CreateContainerRequest>,
) -> Response {
    let sandbox = match state.sandboxes.load(&request.pod_sandbox_id) {
        Ok(sandbox) => sandbox,
        Err(e) => return cri_error(e),
    };

    let config = request.config;
    let mut options = ContainerOptions {
        name: format!("{}_{}", sandbox.name, config.metadata.name),
        image: config.image.image,
        command: config.command,
        args: config.args,
        network_mode: sandbox.network_mode,
        labels: config.labels,
        ..Default::default()
    };
    if !config.working_dir.is_empty() {
        options.working_dir = Some(config.working_dir);
    }
    for env in config.envs {
        options.env.insert(env.key, env.value);
    }
    for mount in config.mounts {
        options.mounts.push(MountSpec {
            source: mount.host_path,
            target: mount.container_path,
            read_only: mount.readonly,
        });
    }
    if let Some(linux) = config.linux {
        if linux.resources.memory_limit_in_bytes > 0 {
            options.memory_limit = linux.resources.memory_limit_in_bytes as u64;
        }
        if linux.resources.cpu_quota > 0 && linux.resources.cpu_period > 0 {
            options.cpu_quota =
                linux.resources.cpu_quota as f64 / linux.resources.cpu_period as f64;
        }
    }

    let record = match state.runtime.create(options).await {
        Ok(record) => record,
        Err(e) => return cri_error(e),
    };

    // Bind the container to its sandbox; it cannot outlive it. An unbound
    // container would be invisible to sandbox-scoped removal, so a failed
    // bind takes the container down with it.
    if let Err(e) = state
        .runtime
        .bind_sandbox(record.id.as_str(), &request.pod_sandbox_id)
        .await
    {
        if let Err(remove_err) = state.runtime.remove(record.id.as_str(), true).await {
            tracing::warn!(
                container = %record.id,
                error = %remove_err,
                "failed to clean up container after sandbox bind failure"
            );
        }
        return cri_error(e);
    }

    ok(CreateContainerResponse {
        container_id: record.id.as_str().to_string(),
    })
}

async fn start_container(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<ContainerIdRequest>,
) -> Response {
    match state.runtime.start(&request.container_id).await {
        Ok(_) => ok(serde_json::json!({})),
        Err(e) => cri_error(e),
    }
}

async fn stop_container(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<StopContainerRequest>,
) -> Response {
    let timeout = Duration::from_secs(request.timeout.max(0) as u64);
    match state
        .runtime
        .stop(&request.container_id, Some(timeout))
        .await
    {
        Ok(_) => ok(serde_json::json!({})),
        Err(ServinError::NotRunning(_)) => ok(serde_json::json!({})),
        Err(e) => cri_error(e),
    }
}

async fn remove_container(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<ContainerIdRequest>,
) -> Response {
    match state.runtime.remove(&request.container_id, true).await {
        Ok(()) => ok(serde_json::json!({})),
        Err(e) => cri_error(e),
    }
}

async fn container_status(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<ContainerIdRequest>,
) -> Response {
    let filter = ContainerFilter::default();
    let records = match state.runtime.list(&filter).await {
        Ok(records) => records,
        Err(e) => return cri_error(e),
    };
    let Some(record) = records
        .iter()
        .find(|r| r.id.as_str() == request.container_id || r.name == request.container_id)
    else {
        return cri_error(ServinError::NotFound(format!(
            "container {}",
            request.container_id
        )));
    };

    ok(ContainerStatusResponse {
        status: container_status_wire(record),
    })
}

fn container_status_wire(record: &ContainerRecord) -> super::types::ContainerStatus {
    super::types::ContainerStatus {
        id: record.id.as_str().to_string(),
        metadata: ContainerMetadata {
            name: record.name.clone(),
            attempt: 0,
        },
        state: state_string(record.status).to_string(),
        created_at: nanos(Some(record.created_at)),
        started_at: nanos(record.started_at),
        finished_at: nanos(record.finished_at),
        exit_code: record.exit_code.unwrap_or(0),
        image: ImageSpec {
            image: record.config.image.clone(),
        },
        image_ref: record.config.image.clone(),
        reason: String::new(),
        message: record.error.clone().unwrap_or_default(),
        labels: record.labels().clone(),
        log_path: String::new(),
    }
}

async fn list_containers(
    State(state): State<Arc<CriServer>>,
    request: Option<Json<ListContainersRequest>>,
) -> Response {
    let wire_filter = request.and_then(|Json(r)| r.filter).unwrap_or_default();
    let filter = ContainerFilter {
        sandbox_id: wire_filter.pod_sandbox_id,
        label_selector: wire_filter.label_selector,
        ..Default::default()
    };
    let records = match state.runtime.list(&filter).await {
        Ok(records) => records,
        Err(e) => return cri_error(e),
    };
    let containers: Vec<CriContainer> = records
        .iter()
        .filter(|r| {
            wire_filter
                .id
                .as_deref()
                .is_none_or(|id| r.id.as_str() == id)
        })
        // Only sandbox-owned containers appear on the CRI surface.
        .filter(|r| r.sandbox_id.is_some())
        .map(to_cri_container)
        .collect();
    ok(ListContainersResponse { containers })
}

async fn exec_sync(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<ExecSyncRequest>,
) -> Response {
    let exec = state
        .runtime
        .exec(&request.container_id, &request.cmd, false);
    let result = if request.timeout > 0 {
        match tokio::time::timeout(Duration::from_secs(request.timeout as u64), exec).await {
            Ok(result) => result,
            Err(_) => {
                return cri_error(ServinError::Timeout(format!(
                    "exec exceeded {}s",
                    request.timeout
                )));
            }
        }
    } else {
        exec.await
    };
    match result {
        Ok(outcome) => ok(ExecSyncResponse {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
        }),
        Err(e) => cri_error(e),
    }
}

// ----------------------------------------------------------------------
// Image service
// ----------------------------------------------------------------------

async fn list_images(State(state): State<Arc<CriServer>>) -> Response {
    match state.images.list() {
        Ok(records) => ok(ListImagesResponse {
            images: records
                .iter()
                .map(|r| CriImage {
                    id: r.id.clone(),
                    repo_tags: r.repo_tags.clone(),
                    size: r.size,
                })
                .collect(),
        }),
        Err(e) => cri_error(e),
    }
}

async fn image_status(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<ImageSpecRequest>,
) -> Response {
    match state.images.inspect(&request.image.image) {
        Ok(record) => ok(ImageStatusResponse {
            image: Some(CriImage {
                id: record.id,
                repo_tags: record.repo_tags,
                size: record.size,
            }),
        }),
        Err(ServinError::ImageNotFound(_)) => ok(ImageStatusResponse { image: None }),
        Err(e) => cri_error(e),
    }
}

async fn pull_image(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<ImageSpecRequest>,
) -> Response {
    // Already local: report its id.
    if let Ok(record) = state.images.inspect(&request.image.image) {
        return ok(PullImageResponse {
            image_ref: record.id,
        });
    }

    let reference = match ImageReference::parse(&request.image.image) {
        Ok(reference) => reference,
        Err(e) => return cri_error(e),
    };
    let config = match RegistryConfig::load(&state.layout) {
        Ok(config) => config,
        Err(e) => return cri_error(e),
    };
    let client = match RegistryClient::for_address(&config.default_registry, &config) {
        Ok(client) => client,
        Err(e) => return cri_error(e),
    };
    match client.pull(&state.images, &reference).await {
        Ok(record) => ok(PullImageResponse {
            image_ref: record.id,
        }),
        Err(e) => cri_error(e),
    }
}

async fn remove_image(
    State(state): State<Arc<CriServer>>,
    Json(request): Json<ImageSpecRequest>,
) -> Response {
    // Removal is refused while a live container references the image.
    let in_use = match state.runtime.list(&ContainerFilter::default()).await {
        Ok(records) => records
            .iter()
            .any(|r| r.status.is_active() && r.config.image == request.image.image),
        Err(e) => return cri_error(e),
    };
    match state.images.remove(&request.image.image, false, in_use) {
        Ok(()) => ok(serde_json::json!({})),
        Err(e) => cri_error(e),
    }
}

async fn image_fs_info(State(state): State<Arc<CriServer>>) -> Response {
    let used: u64 = state
        .images
        .list()
        .map(|records| records.iter().map(|r| r.size).sum())
        .unwrap_or(0);
    ok(ImageFsInfoResponse {
        image_filesystems: vec![FilesystemUsage {
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or(0),
            mountpoint: state.layout.images_dir().display().to_string(),
            used_bytes: used,
        }],
    })
}
