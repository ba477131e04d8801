//! CRI wire types.
//!
//! Request/response envelopes mirror the CRI v1alpha2 message shapes over
//! HTTP+JSON, restricted to the verbs this runtime serves.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------
// Runtime service
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub runtime_api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeCondition {
    pub r#type: String,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub conditions: Vec<RuntimeCondition>,
}

// ----------------------------------------------------------------------
// Pod sandboxes
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PodSandboxMetadata {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NamespaceOption {
    /// `POD` (default) or `NODE` for host networking.
    #[serde(default)]
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinuxSandboxSecurityContext {
    #[serde(default)]
    pub namespace_options: Option<NamespaceOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinuxPodSandboxConfig {
    #[serde(default)]
    pub security_context: Option<LinuxSandboxSecurityContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PodSandboxConfig {
    pub metadata: PodSandboxMetadata,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub log_directory: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub linux: Option<LinuxPodSandboxConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunPodSandboxRequest {
    pub config: PodSandboxConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPodSandboxResponse {
    pub pod_sandbox_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodSandboxIdRequest {
    pub pod_sandbox_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSandbox {
    pub id: String,
    pub metadata: PodSandboxMetadata,
    pub state: String,
    pub created_at: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PodSandboxStatusResponse {
    pub status: PodSandbox,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PodSandboxFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListPodSandboxRequest {
    #[serde(default)]
    pub filter: Option<PodSandboxFilter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListPodSandboxResponse {
    pub items: Vec<PodSandbox>,
}

// ----------------------------------------------------------------------
// Containers
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerMetadata {
    pub name: String,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImageSpec {
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CriMount {
    pub container_path: String,
    pub host_path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinuxContainerResources {
    #[serde(default)]
    pub cpu_period: i64,
    #[serde(default)]
    pub cpu_quota: i64,
    #[serde(default)]
    pub memory_limit_in_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinuxContainerConfig {
    #[serde(default)]
    pub resources: LinuxContainerResources,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerConfig {
    pub metadata: ContainerMetadata,
    pub image: ImageSpec,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub envs: Vec<KeyValue>,
    #[serde(default)]
    pub mounts: Vec<CriMount>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub linux: Option<LinuxContainerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateContainerRequest {
    pub pod_sandbox_id: String,
    pub config: ContainerConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateContainerResponse {
    pub container_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerIdRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopContainerRequest {
    pub container_id: String,
    /// Grace period in seconds.
    #[serde(default)]
    pub timeout: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CriContainer {
    pub id: String,
    pub pod_sandbox_id: String,
    pub metadata: ContainerMetadata,
    pub image: ImageSpec,
    pub image_ref: String,
    pub state: String,
    pub created_at: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ContainerFilterRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub pod_sandbox_id: Option<String>,
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListContainersRequest {
    #[serde(default)]
    pub filter: Option<ContainerFilterRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListContainersResponse {
    pub containers: Vec<CriContainer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub id: String,
    pub metadata: ContainerMetadata,
    pub state: String,
    pub created_at: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub exit_code: i32,
    pub image: ImageSpec,
    pub image_ref: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub log_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatusResponse {
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecSyncRequest {
    pub container_id: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub timeout: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecSyncResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

// ----------------------------------------------------------------------
// Image service
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CriImage {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListImagesResponse {
    pub images: Vec<CriImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSpecRequest {
    pub image: ImageSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageStatusResponse {
    pub image: Option<CriImage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullImageResponse {
    pub image_ref: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesystemUsage {
    pub timestamp: i64,
    pub mountpoint: String,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageFsInfoResponse {
    pub image_filesystems: Vec<FilesystemUsage>,
}

// ----------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CriError {
    pub code: String,
    pub reason: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_request_parses_minimal_payload() {
        let json = r#"{"config":{"metadata":{"name":"test","namespace":"default"}}}"#;
        let request: RunPodSandboxRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.config.metadata.name, "test");
        assert_eq!(request.config.metadata.namespace, "default");
        assert_eq!(request.config.metadata.attempt, 0);
    }

    #[test]
    fn test_container_create_parses_cri_shapes() {
        let json = r#"{
            "pod_sandbox_id": "abc",
            "config": {
                "metadata": {"name": "app"},
                "image": {"image": "alpine:latest"},
                "command": ["/bin/sh"],
                "args": ["-c", "sleep 5"],
                "envs": [{"key": "A", "value": "1"}]
            }
        }"#;
        let request: CreateContainerRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.pod_sandbox_id, "abc");
        assert_eq!(request.config.image.image, "alpine:latest");
        assert_eq!(request.config.envs[0].key, "A");
    }
}
