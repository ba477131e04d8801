//! VM-forwarding backend.
//!
//! Implements the engine surface by translating every operation into an
//! equivalent invocation of the in-guest runtime over SSH. Records are still
//! kept in the host's state store, but the container id is the one the guest
//! assigned, so follow-up operations route straight back through here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::container::{ContainerFilter, ContainerManager, LogQuery};
use crate::errors::{ServinError, ServinResult};
use crate::isolation::CgroupStats;
use crate::runtime::backend::{ContainerRuntime, ExecResult};
use crate::runtime::options::ContainerOptions;
use crate::runtime::types::{ContainerId, ContainerRecord, ContainerStatus, NetworkMode};
use crate::vm::manager::VmManager;

/// Labels carrying the VM info snapshot on records created in VM mode.
const LABEL_VM_NAME: &str = "servin.vm/name";
const LABEL_VM_PROVIDER: &str = "servin.vm/provider";

pub struct VmRuntime {
    vm: Arc<VmManager>,
    manager: ContainerManager,
}

impl VmRuntime {
    pub fn new(vm: Arc<VmManager>, manager: ContainerManager) -> Self {
        Self { vm, manager }
    }

    pub fn vm(&self) -> &Arc<VmManager> {
        &self.vm
    }

    async fn guest_runtime(&self, argv: &[&str]) -> ServinResult<String> {
        let mut full = vec!["docker"];
        full.extend_from_slice(argv);
        let output = self.vm.ssh_exec(&full).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.contains("No such container") {
                return Err(ServinError::NotFound(stderr.to_string()));
            }
            return Err(ServinError::VmUnavailable(format!(
                "guest runtime: docker {} failed: {stderr}",
                argv.join(" ")
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for VmRuntime {
    async fn create(&self, options: ContainerOptions) -> ServinResult<ContainerRecord> {
        options.validate()?;
        let info = self.vm.ensure_running().await?;

        let mut argv: Vec<String> = vec!["create".into()];
        if !options.name.is_empty() {
            argv.push("--name".into());
            argv.push(options.name.clone());
        }
        for (key, value) in &options.env {
            argv.push("-e".into());
            argv.push(format!("{key}={value}"));
        }
        for mapping in &options.port_mappings {
            argv.push("-p".into());
            argv.push(format!(
                "{}:{}/{}",
                mapping.host_port,
                mapping.container_port,
                mapping.protocol.as_str()
            ));
        }
        if let Some(workdir) = &options.working_dir {
            argv.push("-w".into());
            argv.push(workdir.clone());
        }
        argv.push(options.image.clone());
        argv.extend(options.command.iter().cloned());
        argv.extend(options.args.iter().cloned());

        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        let guest_id = self.guest_runtime(&argv_refs).await?;
        if guest_id.is_empty() {
            return Err(ServinError::Internal(
                "guest runtime returned no container id".into(),
            ));
        }

        let mut options = options;
        options.network_mode = NetworkMode::Vm;
        options
            .labels
            .insert(LABEL_VM_NAME.to_string(), info.name.clone());
        options
            .labels
            .insert(LABEL_VM_PROVIDER.to_string(), info.provider.clone());

        let mut record = ContainerRecord::new(options);
        // The guest owns the identity; replace the locally generated id.
        record.id = ContainerId::from_string(guest_id);
        if record.config.name.is_empty() {
            record.name = record.id.short().to_string();
        }
        self.manager.register(record.clone())?;
        tracing::info!(container = %record.id, vm = %info.name, "created container in guest");
        Ok(record)
    }

    async fn start(&self, id_or_name: &str) -> ServinResult<ContainerRecord> {
        let record = self.manager.resolve(id_or_name)?;
        if record.status.is_active() {
            return Err(ServinError::AlreadyRunning(format!("container {}", record.id)));
        }
        self.vm.ensure_running().await?;
        self.guest_runtime(&["start", record.id.as_str()]).await?;
        self.manager.update(&record.id, |r| {
            r.status = ContainerStatus::Running;
            r.started_at = Some(Utc::now());
            r.error = None;
        })
    }

    async fn stop(
        &self,
        id_or_name: &str,
        timeout: Option<Duration>,
    ) -> ServinResult<ContainerRecord> {
        let record = self.manager.resolve(id_or_name)?;
        if record.status != ContainerStatus::Running {
            return Err(ServinError::NotRunning(format!("container {}", record.id)));
        }
        self.vm.ensure_running().await?;
        let grace = timeout.unwrap_or(Duration::from_secs(10)).as_secs().to_string();
        self.guest_runtime(&["stop", "-t", &grace, record.id.as_str()])
            .await?;
        self.manager.update(&record.id, |r| {
            r.status = ContainerStatus::Exited;
            r.pid = 0;
            r.finished_at = Some(Utc::now());
        })
    }

    async fn remove(&self, id_or_name: &str, force: bool) -> ServinResult<()> {
        let record = self.manager.resolve(id_or_name)?;
        if record.status.is_active() && !force {
            return Err(ServinError::InUse(format!(
                "container {} is running; use force to remove",
                record.id
            )));
        }
        self.vm.ensure_running().await?;
        let result = if force {
            self.guest_runtime(&["rm", "-f", record.id.as_str()]).await
        } else {
            self.guest_runtime(&["rm", record.id.as_str()]).await
        };
        match result {
            Ok(_) | Err(ServinError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.manager.remove(&record.id)?;
        Ok(())
    }

    async fn exec(&self, id_or_name: &str, argv: &[String], tty: bool) -> ServinResult<ExecResult> {
        let record = self.manager.resolve(id_or_name)?;
        if record.status != ContainerStatus::Running {
            return Err(ServinError::NotRunning(format!("container {}", record.id)));
        }
        self.vm.ensure_running().await?;

        let mut full: Vec<&str> = vec!["docker", "exec"];
        if tty {
            full.push("-t");
        }
        full.push(record.id.as_str());
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        full.extend(argv_refs);

        let output = self.vm.ssh_exec(&full).await?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn logs(&self, id_or_name: &str, query: &LogQuery) -> ServinResult<Vec<String>> {
        let record = self.manager.resolve(id_or_name)?;
        self.vm.ensure_running().await?;

        let mut argv: Vec<String> = vec!["logs".into()];
        if let Some(tail) = query.tail {
            argv.push("--tail".into());
            argv.push(tail.to_string());
        }
        if let Some(since) = query.since {
            argv.push("--since".into());
            argv.push(since.to_rfc3339());
        }
        if query.timestamps {
            argv.push("--timestamps".into());
        }
        argv.push(record.id.as_str().to_string());

        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        let stdout = self.guest_runtime(&argv_refs).await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    async fn stats(&self, id_or_name: &str) -> ServinResult<CgroupStats> {
        let record = self.manager.resolve(id_or_name)?;
        if record.status != ContainerStatus::Running {
            return Err(ServinError::NotRunning(format!("container {}", record.id)));
        }
        self.vm.ensure_running().await?;

        // Raw cgroup counters read inside the guest.
        let script = format!(
            "cat /sys/fs/cgroup/system.slice/docker-{id}.scope/memory.current 2>/dev/null || echo 0",
            id = record.id.as_str()
        );
        let output = self.vm.ssh_exec(&["sh", "-c", &script]).await?;
        let memory_current = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .unwrap_or(0);
        Ok(CgroupStats {
            memory_current,
            ..Default::default()
        })
    }

    async fn list(&self, filter: &ContainerFilter) -> ServinResult<Vec<ContainerRecord>> {
        Ok(self.manager.list(filter))
    }

    async fn bind_sandbox(&self, id_or_name: &str, sandbox_id: &str) -> ServinResult<()> {
        let record = self.manager.resolve(id_or_name)?;
        let sandbox_id = sandbox_id.to_string();
        self.manager
            .update(&record.id, |r| r.sandbox_id = Some(sandbox_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_label_keys_are_namespaced() {
        assert!(LABEL_VM_NAME.starts_with("servin.vm/"));
        assert!(LABEL_VM_PROVIDER.starts_with("servin.vm/"));
    }
}
