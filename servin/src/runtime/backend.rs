//! Backend selection seam.
//!
//! The engine's public surface is a single trait with two implementations:
//! the native engine driving Linux isolation directly, and the VM runtime
//! forwarding the same operations into the managed guest over SSH. The
//! composition root picks one at construction time.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::container::{ContainerFilter, LogQuery};
use crate::errors::ServinResult;
use crate::isolation::CgroupStats;
use crate::runtime::options::ContainerOptions;
use crate::runtime::types::ContainerRecord;

/// Result of a synchronous command execution inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The engine's operation surface, implemented by both the native and the
/// VM-forwarding backends.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Register a container in state `created`.
    async fn create(&self, options: ContainerOptions) -> ServinResult<ContainerRecord>;

    /// Drive `created`/`exited` to `running`.
    async fn start(&self, id_or_name: &str) -> ServinResult<ContainerRecord>;

    /// SIGTERM, wait up to `timeout` (default 10 s), then SIGKILL.
    /// A timeout of zero skips straight to SIGKILL.
    async fn stop(
        &self,
        id_or_name: &str,
        timeout: Option<Duration>,
    ) -> ServinResult<ContainerRecord>;

    /// Delete the record and clean the rootfs. Running containers are
    /// refused unless `force` is set.
    async fn remove(&self, id_or_name: &str, force: bool) -> ServinResult<()>;

    /// Run a command inside a running container and collect its output.
    async fn exec(&self, id_or_name: &str, argv: &[String], tty: bool) -> ServinResult<ExecResult>;

    /// Read captured logs (non-follow path).
    async fn logs(&self, id_or_name: &str, query: &LogQuery) -> ServinResult<Vec<String>>;

    /// Resource readings for a running container.
    async fn stats(&self, id_or_name: &str) -> ServinResult<CgroupStats>;

    /// Filtered record snapshots.
    async fn list(&self, filter: &ContainerFilter) -> ServinResult<Vec<ContainerRecord>>;

    /// Attach a container to a CRI pod sandbox. The container cannot
    /// outlive the sandbox after this.
    async fn bind_sandbox(&self, id_or_name: &str, sandbox_id: &str) -> ServinResult<()>;
}
