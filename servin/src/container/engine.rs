//! Native container engine.
//!
//! Composes the isolation primitives and the rootfs builder to drive the
//! container lifecycle, records every transition through the manager, and
//! streams stdout/stderr into the per-container log directory.
//!
//! Start walks `preparing rootfs -> creating network -> starting init`; a
//! failure at any step rolls back in reverse acquisition order and leaves the
//! record in `exited` with the error message persisted.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::container::logs::{self, LogQuery};
use crate::container::manager::{ContainerFilter, ContainerManager};
use crate::errors::{ServinError, ServinResult};
use crate::images::ImageStore;
use crate::isolation::{
    BindMount, Cgroup, CgroupLimits, CgroupStats, InitConfig, spawn_container_init,
};
use crate::network::{Bridge, IpamPool, apply_port_mappings, remove_port_mappings, setup_loopback_only};
use crate::rootfs::RootfsBuilder;
use crate::runtime::backend::{ContainerRuntime, ExecResult};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::ContainerOptions;
use crate::runtime::types::{
    ContainerId, ContainerRecord, ContainerStatus, NetworkMode,
};
use crate::store::VolumeStore;
use crate::util::signal_process;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const START_TIMEOUT: Duration = Duration::from_secs(60);
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct EngineInner {
    layout: FilesystemLayout,
    manager: ContainerManager,
    images: Arc<ImageStore>,
    volumes: Arc<VolumeStore>,
    rootfs: RootfsBuilder,
    bridge: Bridge,
    ipam: Arc<IpamPool>,
    /// Per-container operation locks; transitions on one id are serialized.
    op_locks: Mutex<std::collections::HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Host-native backend.
#[derive(Clone)]
pub struct NativeEngine {
    inner: Arc<EngineInner>,
}

impl NativeEngine {
    pub fn new(
        layout: FilesystemLayout,
        manager: ContainerManager,
        images: Arc<ImageStore>,
        volumes: Arc<VolumeStore>,
        bridge: Bridge,
        ipam: Arc<IpamPool>,
    ) -> Self {
        let rootfs = RootfsBuilder::new(layout.clone());
        Self {
            inner: Arc::new(EngineInner {
                layout,
                manager,
                images,
                volumes,
                rootfs,
                bridge,
                ipam,
                op_locks: Mutex::new(std::collections::HashMap::new()),
            }),
        }
    }

    pub fn manager(&self) -> ContainerManager {
        self.inner.manager.clone()
    }

    fn op_lock(&self, id: &ContainerId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.op_locks.lock();
        locks
            .entry(id.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Merge image defaults with the user's options into the exec argv.
    fn compute_argv(record: &ContainerRecord, image: &crate::images::ImageRecord) -> ServinResult<Vec<String>> {
        let mut argv = image.config.entrypoint.clone();
        if record.config.command.is_empty() {
            argv.extend(image.config.cmd.iter().cloned());
        } else {
            argv.extend(record.config.command.iter().cloned());
        }
        argv.extend(record.config.args.iter().cloned());
        if argv.is_empty() {
            return Err(ServinError::InvalidConfig(format!(
                "container {} has no command and image {} has no default",
                record.id, record.config.image
            )));
        }
        Ok(argv)
    }

    /// Environment: image defaults first, then the container's overrides,
    /// with a PATH fallback when neither provides one.
    fn compute_env(record: &ContainerRecord, image: &crate::images::ImageRecord) -> Vec<String> {
        let mut env = image.config.env.clone();
        for (key, value) in &record.config.env {
            let entry = format!("{key}={value}");
            match env
                .iter_mut()
                .find(|e| e.split_once('=').map(|(k, _)| k) == Some(key.as_str()))
            {
                Some(existing) => *existing = entry,
                None => env.push(entry),
            }
        }
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push("PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into());
        }
        env
    }

    /// Resolve mount specs: absolute sources are host bind mounts, anything
    /// else names a volume (created on first reference).
    fn resolve_binds(&self, record: &ContainerRecord) -> ServinResult<Vec<BindMount>> {
        let mut binds = Vec::with_capacity(record.config.mounts.len());
        for mount in &record.config.mounts {
            let source = if mount.source.starts_with('/') {
                PathBuf::from(&mount.source)
            } else {
                self.inner.volumes.ensure(&mount.source)?.mountpoint
            };
            binds.push(BindMount {
                source,
                target: mount.target.clone(),
                read_only: mount.read_only,
            });
        }
        Ok(binds)
    }

    async fn start_inner(&self, record: ContainerRecord) -> ServinResult<ContainerRecord> {
        let id = record.id.clone();
        let inner = &self.inner;

        let image = inner.images.inspect(&record.config.image).map_err(|e| match e {
            ServinError::ImageNotFound(_) | ServinError::Ambiguous(_) => e,
            other => other,
        })?;
        let argv = Self::compute_argv(&record, &image)?;
        let env = Self::compute_env(&record, &image);
        let binds = self.resolve_binds(&record)?;
        let hostname = record
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| record.name.clone());
        let working_dir = record
            .config
            .working_dir
            .clone()
            .unwrap_or_else(|| image.config.working_dir.clone());

        // Step 1: prepare the rootfs (blocking archive work off the dispatcher).
        tracing::debug!(container = %id, "preparing rootfs");
        let rootfs_path = {
            let engine = self.clone();
            let id = id.clone();
            let image_id = image.id.clone();
            let hostname = hostname.clone();
            let mounts = record.config.mounts.clone();
            tokio::task::spawn_blocking(move || {
                engine.inner.rootfs.prepare(
                    id.as_str(),
                    &image_id,
                    &engine.inner.images,
                    &hostname,
                    &mounts,
                )
            })
            .await
            .map_err(|e| ServinError::Internal(format!("rootfs task: {e}")))??
        };

        // Step 2: network resources that exist before the init process.
        tracing::debug!(container = %id, mode = record.config.network_mode.as_str(), "creating network");
        let mut allocated_ip: Option<Ipv4Addr> = None;
        if record.config.network_mode == NetworkMode::Bridge {
            if let Err(e) = inner.bridge.ensure() {
                self.rollback_start(&id, None, false, record.config.keep_rootfs_on_failure, &[]);
                return self.fail_start(&id, e).await;
            }
            match inner.ipam.allocate(id.as_str()) {
                Ok(ip) => allocated_ip = Some(ip),
                Err(e) => {
                    self.rollback_start(&id, None, false, record.config.keep_rootfs_on_failure, &[]);
                    return self.fail_start(&id, e).await;
                }
            }
        }

        // Step 3: cgroup leaf. A missing controller is a WARN, not an abort.
        let limits = CgroupLimits {
            memory_max: (record.config.memory_limit > 0).then_some(record.config.memory_limit),
            cpu_cores: (record.config.cpu_quota > 0.0).then_some(record.config.cpu_quota),
            ..Default::default()
        };
        let cgroup = match Cgroup::create(id.as_str(), &limits) {
            Ok(cgroup) => cgroup,
            Err(e) => {
                tracing::warn!(container = %id, error = %e, "continuing without cgroup");
                None
            }
        };

        // Step 4: clone the init process.
        tracing::debug!(container = %id, ?argv, "starting init");
        let init_config = InitConfig {
            rootfs: rootfs_path,
            hostname,
            working_dir,
            argv,
            env,
            network_mode: record.config.network_mode,
            binds,
            drop_capabilities: true,
            no_new_privileges: true,
            userns: None,
        };
        let spawned = match spawn_container_init(&init_config) {
            Ok(spawned) => spawned,
            Err(e) => {
                if let Some(cgroup) = &cgroup {
                    cgroup.remove();
                }
                self.rollback_start(
                    &id,
                    allocated_ip,
                    false,
                    record.config.keep_rootfs_on_failure,
                    &record.config.port_mappings,
                );
                return self.fail_start(&id, e).await;
            }
        };
        let pid = spawned.pid;

        if let Some(cgroup) = &cgroup {
            if let Err(e) = cgroup.add_process(pid) {
                tracing::warn!(container = %id, error = %e, "init not placed in cgroup");
            }
        }

        // Step 5: attach networking to the parked init, then release it.
        let network_result = match (record.config.network_mode, allocated_ip) {
            (NetworkMode::Bridge, Some(ip)) => inner
                .bridge
                .attach(id.as_str(), pid, ip)
                .and_then(|()| apply_port_mappings(ip, &record.config.port_mappings)),
            (NetworkMode::None, _) => setup_loopback_only(pid),
            _ => Ok(()),
        };
        if let Err(e) = network_result {
            signal_process(pid, libc::SIGKILL);
            if let Some(cgroup) = &cgroup {
                cgroup.remove();
            }
            self.rollback_start(
                &id,
                allocated_ip,
                true,
                record.config.keep_rootfs_on_failure,
                &[],
            );
            return self.fail_start(&id, e).await;
        }

        let released = spawned.release();
        let (stdout_fd, stderr_fd) = match released {
            Ok(fds) => fds,
            Err(e) => {
                signal_process(pid, libc::SIGKILL);
                if let Some(cgroup) = &cgroup {
                    cgroup.remove();
                }
                self.rollback_start(
                    &id,
                    allocated_ip,
                    true,
                    record.config.keep_rootfs_on_failure,
                    &record.config.port_mappings,
                );
                return self.fail_start(&id, e).await;
            }
        };

        // Step 6: log capture, then make the transition visible. The pid is
        // persisted before the record is marked running.
        let container_dir = inner.layout.container_dir(id.as_str());
        logs::spawn_log_pump(stdout_fd, container_dir.join(logs::STDOUT_LOG));
        logs::spawn_log_pump(stderr_fd, container_dir.join(logs::STDERR_LOG));

        inner.manager.update(&id, |r| {
            r.pid = pid;
            r.started_at = Some(Utc::now());
            r.error = None;
            r.exit_code = None;
            r.finished_at = None;
            r.ip_address = allocated_ip.map(|ip| ip.to_string());
        })?;
        let record = inner.manager.update_status(&id, ContainerStatus::Running)?;

        self.spawn_reaper(id.clone(), pid, cgroup, allocated_ip, record.config.port_mappings.clone());

        tracing::info!(container = %id, pid, "container running");
        Ok(record)
    }

    /// Mark a failed start: record ends `exited` with the error persisted.
    async fn fail_start(&self, id: &ContainerId, error: ServinError) -> ServinResult<ContainerRecord> {
        let message = error.to_string();
        let _ = self.inner.manager.update(id, |r| {
            r.status = ContainerStatus::Exited;
            r.pid = 0;
            r.finished_at = Some(Utc::now());
            r.error = Some(message.clone());
        });
        Err(error)
    }

    /// Reverse-order resource release for an aborted start.
    fn rollback_start(
        &self,
        id: &ContainerId,
        allocated_ip: Option<Ipv4Addr>,
        veth_attached: bool,
        keep_rootfs: bool,
        mappings: &[crate::runtime::types::PortMapping],
    ) {
        if let Some(ip) = allocated_ip {
            if !mappings.is_empty() {
                remove_port_mappings(ip, mappings);
            }
            if veth_attached {
                self.inner.bridge.detach(id.as_str());
            }
            if let Err(e) = self.inner.ipam.release(id.as_str()) {
                tracing::warn!(container = %id, error = %e, "ip not released");
            }
        }
        if !keep_rootfs {
            self.inner.rootfs.teardown(id.as_str());
        }
    }

    /// Wait for the init process and finalize the record when it exits.
    fn spawn_reaper(
        &self,
        id: ContainerId,
        pid: u32,
        cgroup: Option<Cgroup>,
        ip: Option<Ipv4Addr>,
        mappings: Vec<crate::runtime::types::PortMapping>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || {
                use nix::sys::wait::{WaitStatus, waitpid};
                match waitpid(nix::unistd::Pid::from_raw(pid as i32), None) {
                    Ok(WaitStatus::Exited(_, code)) => code,
                    Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
                    Ok(other) => {
                        tracing::debug!(?other, "unexpected wait status");
                        -1
                    }
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "waitpid failed");
                        -1
                    }
                }
            })
            .await
            .unwrap_or(-1);

            tracing::info!(container = %id, pid, exit_code = status, "container exited");

            if let Some(ip) = ip {
                remove_port_mappings(ip, &mappings);
                engine.inner.bridge.detach(id.as_str());
                if let Err(e) = engine.inner.ipam.release(id.as_str()) {
                    tracing::warn!(container = %id, error = %e, "ip not released");
                }
            }
            if let Some(cgroup) = &cgroup {
                cgroup.remove();
            }

            let result = engine.inner.manager.update(&id, |r| {
                r.status = ContainerStatus::Exited;
                r.pid = 0;
                r.exit_code = Some(status);
                r.finished_at = Some(Utc::now());
                r.ip_address = None;
            });
            if let Err(e) = result {
                tracing::debug!(container = %id, error = %e, "exit not recorded (removed?)");
            }
        });
    }

    /// Poll until the reaper marks the container exited, or the deadline
    /// passes. Returns the final record on success.
    ///
    /// A container recovered from a previous runtime process has no reaper;
    /// when its pid is gone but the record still claims running, the record
    /// is finalized here.
    async fn await_exit(&self, id: &ContainerId, deadline: Duration) -> Option<ContainerRecord> {
        let start = tokio::time::Instant::now();
        loop {
            let record = match self.inner.manager.get(id) {
                Ok(record) if record.status != ContainerStatus::Running => return Some(record),
                Err(_) => return None,
                Ok(record) => record,
            };

            if record.pid != 0 && !crate::util::is_process_alive(record.pid) {
                // Give an in-process reaper one interval to win the race.
                tokio::time::sleep(STATE_POLL_INTERVAL).await;
                match self.inner.manager.get(id) {
                    Ok(r) if r.status != ContainerStatus::Running => return Some(r),
                    Err(_) => return None,
                    Ok(_) => {
                        let updated = self.inner.manager.update(id, |r| {
                            r.status = ContainerStatus::Exited;
                            r.pid = 0;
                            r.finished_at = Some(Utc::now());
                        });
                        return updated.ok();
                    }
                }
            }

            if start.elapsed() >= deadline {
                return None;
            }
            tokio::time::sleep(STATE_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for NativeEngine {
    async fn create(&self, options: ContainerOptions) -> ServinResult<ContainerRecord> {
        options.validate()?;
        // The image must resolve at creation time as well as at start.
        self.inner.images.resolve(&options.image).map_err(|_| {
            ServinError::ImageNotFound(options.image.clone())
        })?;

        let record = ContainerRecord::new(options);
        // The rootfs path exists from creation to removal.
        std::fs::create_dir_all(self.inner.rootfs.rootfs_path(record.id.as_str()))
            .map_err(|e| ServinError::Storage(format!("container dir: {e}")))?;
        self.inner.manager.register(record.clone())?;
        tracing::info!(container = %record.id, name = %record.name, "created container");
        Ok(record)
    }

    async fn start(&self, id_or_name: &str) -> ServinResult<ContainerRecord> {
        let record = self.inner.manager.resolve(id_or_name)?;
        let lock = self.op_lock(&record.id);
        let _guard = lock.lock().await;

        // Re-read under the lock.
        let record = self.inner.manager.get(&record.id)?;
        match record.status {
            ContainerStatus::Created => {}
            ContainerStatus::Exited => {
                // Restart over a fresh rootfs.
                self.inner.rootfs.teardown(record.id.as_str());
            }
            ContainerStatus::Running | ContainerStatus::Paused => {
                return Err(ServinError::AlreadyRunning(format!(
                    "container {}",
                    record.id
                )));
            }
            ContainerStatus::Removed => {
                return Err(ServinError::NotFound(format!("container {}", record.id)));
            }
        }

        let id = record.id.clone();
        match tokio::time::timeout(START_TIMEOUT, self.start_inner(record)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(container = %id, "start timed out, rolling back");
                if let Ok(r) = self.inner.manager.get(&id) {
                    if r.pid != 0 {
                        signal_process(r.pid, libc::SIGKILL);
                    }
                    self.rollback_start(
                        &id,
                        self.inner.ipam.lookup(id.as_str()),
                        true,
                        r.config.keep_rootfs_on_failure,
                        &r.config.port_mappings,
                    );
                }
                let _ = self
                    .fail_start(&id, ServinError::Timeout("start exceeded 60s".into()))
                    .await;
                Err(ServinError::Timeout(format!("start of {id} exceeded 60s")))
            }
        }
    }

    async fn stop(
        &self,
        id_or_name: &str,
        timeout: Option<Duration>,
    ) -> ServinResult<ContainerRecord> {
        let record = self.inner.manager.resolve(id_or_name)?;
        let lock = self.op_lock(&record.id);
        let _guard = lock.lock().await;

        let record = self.inner.manager.get(&record.id)?;
        if record.status != ContainerStatus::Running {
            return Err(ServinError::NotRunning(format!("container {}", record.id)));
        }
        let pid = record.pid;
        let id = record.id.clone();
        let grace = timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);

        // Zero grace means SIGKILL without SIGTERM.
        if !grace.is_zero() {
            tracing::debug!(container = %id, pid, "sending SIGTERM");
            signal_process(pid, libc::SIGTERM);
            if let Some(final_record) = self.await_exit(&id, grace).await {
                return Ok(final_record);
            }
            tracing::debug!(container = %id, pid, "grace expired");
        }

        tracing::debug!(container = %id, pid, "sending SIGKILL");
        signal_process(pid, libc::SIGKILL);
        match self.await_exit(&id, KILL_REAP_TIMEOUT).await {
            Some(final_record) => Ok(final_record),
            None => Err(ServinError::Timeout(format!(
                "container {id} did not exit after SIGKILL"
            ))),
        }
    }

    async fn remove(&self, id_or_name: &str, force: bool) -> ServinResult<()> {
        let record = self.inner.manager.resolve(id_or_name)?;
        let lock = self.op_lock(&record.id);

        {
            let _guard = lock.lock().await;
            let record = self.inner.manager.get(&record.id)?;
            if record.status.is_active() && !force {
                return Err(ServinError::InUse(format!(
                    "container {} is running; use force to remove",
                    record.id
                )));
            }
        }

        // Forced removal of a running container stops it first (the stop
        // path takes the op lock itself).
        let record = self.inner.manager.get(&record.id)?;
        if record.status.is_active() {
            self.stop(record.id.as_str(), Some(Duration::ZERO)).await?;
        }

        let _guard = lock.lock().await;
        let id = record.id.clone();
        self.inner.rootfs.teardown(id.as_str());
        self.inner.manager.remove(&id)?;

        let container_dir = self.inner.layout.container_dir(id.as_str());
        if let Err(e) = std::fs::remove_dir_all(&container_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(container = %id, error = %e, "container dir not fully removed");
            }
        }
        self.inner.op_locks.lock().remove(id.as_str());
        tracing::info!(container = %id, "removed container");
        Ok(())
    }

    async fn exec(&self, id_or_name: &str, argv: &[String], tty: bool) -> ServinResult<ExecResult> {
        let record = self.inner.manager.resolve(id_or_name)?;
        if record.status != ContainerStatus::Running {
            return Err(ServinError::NotRunning(format!("container {}", record.id)));
        }
        if argv.is_empty() {
            return Err(ServinError::InvalidConfig("empty exec command".into()));
        }

        let mut command = tokio::process::Command::new("nsenter");
        command
            .arg("-t")
            .arg(record.pid.to_string())
            .args(["-m", "-u", "-i", "-n", "-p", "--"])
            .args(argv);
        let _ = tty; // No pty allocation on the collected-output path.

        let output = command
            .output()
            .await
            .map_err(|e| ServinError::ExecFailed(format!("nsenter: {e}")))?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn logs(&self, id_or_name: &str, query: &LogQuery) -> ServinResult<Vec<String>> {
        let record = self.inner.manager.resolve(id_or_name)?;
        let dir = self.inner.layout.container_dir(record.id.as_str());
        let query = query.clone();
        tokio::task::spawn_blocking(move || logs::read_logs(&dir, &query))
            .await
            .map_err(|e| ServinError::Internal(format!("log read task: {e}")))?
    }

    async fn stats(&self, id_or_name: &str) -> ServinResult<CgroupStats> {
        let record = self.inner.manager.resolve(id_or_name)?;
        if record.status != ContainerStatus::Running {
            return Err(ServinError::NotRunning(format!("container {}", record.id)));
        }
        Ok(Cgroup::attach(record.id.as_str())
            .map(|cgroup| cgroup.stats())
            .unwrap_or_default())
    }

    async fn list(&self, filter: &ContainerFilter) -> ServinResult<Vec<ContainerRecord>> {
        Ok(self.inner.manager.list(filter))
    }

    async fn bind_sandbox(&self, id_or_name: &str, sandbox_id: &str) -> ServinResult<()> {
        let record = self.inner.manager.resolve(id_or_name)?;
        let sandbox_id = sandbox_id.to_string();
        self.inner
            .manager
            .update(&record.id, |r| r.sandbox_id = Some(sandbox_id))?;
        Ok(())
    }
}

impl NativeEngine {
    /// Follow-mode log delivery; lines are pushed into `tx` until the
    /// receiver is dropped.
    pub async fn follow_logs(
        &self,
        id_or_name: &str,
        query: LogQuery,
        tx: tokio::sync::mpsc::Sender<String>,
    ) -> ServinResult<()> {
        let record = self.inner.manager.resolve(id_or_name)?;
        let dir = self.inner.layout.container_dir(record.id.as_str());
        logs::follow_logs(dir, query, tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::{ImageConfigBlob, ImageManifest, RuntimeDefaults, pack_layer};
    use crate::network::{DEFAULT_BRIDGE, DEFAULT_SUBNET};
    use crate::store::ContainerStore;
    use tempfile::tempdir;

    fn test_engine() -> (tempfile::TempDir, NativeEngine) {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();

        let images = Arc::new(ImageStore::open(&layout).unwrap());
        let volumes = Arc::new(VolumeStore::new(&layout));
        let manager = ContainerManager::new(ContainerStore::new(&layout));
        let subnet = DEFAULT_SUBNET.parse().unwrap();
        let ipam = Arc::new(IpamPool::open(&layout, DEFAULT_BRIDGE, subnet).unwrap());
        let bridge = Bridge::new(DEFAULT_BRIDGE, ipam.gateway(), 16);

        let engine = NativeEngine::new(layout, manager, images, volumes, bridge, ipam);
        (dir, engine)
    }

    fn seed_image(engine: &NativeEngine, tag: &str) {
        let staging = tempdir().unwrap();
        std::fs::write(staging.path().join("hello"), b"hi").unwrap();
        let layer = pack_layer(staging.path(), vec![PathBuf::from("hello")]).unwrap();
        let layer_digest = engine.inner.images.put_blob(&layer).unwrap();
        let config = serde_json::to_vec(&ImageConfigBlob::new(RuntimeDefaults {
            cmd: vec!["/bin/sh".into()],
            ..Default::default()
        }))
        .unwrap();
        let config_digest = engine.inner.images.put_blob(&config).unwrap();
        let manifest = ImageManifest::new(config_digest, vec![layer_digest]);
        engine
            .inner
            .images
            .register_image(&manifest, layer.len() as u64, &[tag.to_string()])
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_requires_existing_image() {
        let (_dir, engine) = test_engine();
        let options = ContainerOptions {
            image: "ghost:latest".into(),
            ..Default::default()
        };
        assert!(matches!(
            engine.create(options).await,
            Err(ServinError::ImageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_registers_created_record() {
        let (_dir, engine) = test_engine();
        seed_image(&engine, "alpine:latest");

        let record = engine
            .create(ContainerOptions {
                image: "alpine:latest".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(record.status, ContainerStatus::Created);
        assert_eq!(record.pid, 0);
        // Deterministic rootfs path exists from creation.
        assert!(engine.inner.rootfs.rootfs_path(record.id.as_str()).is_dir());
    }

    #[tokio::test]
    async fn test_stop_created_container_is_not_running() {
        let (_dir, engine) = test_engine();
        seed_image(&engine, "alpine:latest");
        let record = engine
            .create(ContainerOptions {
                image: "alpine:latest".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(matches!(
            engine.stop(record.id.as_str(), None).await,
            Err(ServinError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_created_container() {
        let (_dir, engine) = test_engine();
        seed_image(&engine, "alpine:latest");
        let record = engine
            .create(ContainerOptions {
                image: "alpine:latest".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        engine.remove(record.id.as_str(), false).await.unwrap();
        assert!(matches!(
            engine.inner.manager.resolve(record.id.as_str()),
            Err(ServinError::NotFound(_))
        ));
        assert!(!engine.inner.layout.container_dir(record.id.as_str()).exists());
    }

    #[tokio::test]
    async fn test_compute_argv_merges_entrypoint_and_cmd() {
        let image = crate::images::ImageRecord {
            id: "x".into(),
            repo_tags: vec![],
            layers: vec![],
            config: RuntimeDefaults {
                entrypoint: vec!["/entry".into()],
                cmd: vec!["default".into()],
                ..Default::default()
            },
            size: 0,
            created_at: Utc::now(),
        };
        let mut record = ContainerRecord::new(ContainerOptions {
            image: "x".into(),
            ..Default::default()
        });
        assert_eq!(
            NativeEngine::compute_argv(&record, &image).unwrap(),
            vec!["/entry", "default"]
        );

        record.config.command = vec!["override".into()];
        record.config.args = vec!["--flag".into()];
        assert_eq!(
            NativeEngine::compute_argv(&record, &image).unwrap(),
            vec!["/entry", "override", "--flag"]
        );
    }

    #[tokio::test]
    async fn test_compute_env_overrides_image_defaults() {
        let image = crate::images::ImageRecord {
            id: "x".into(),
            repo_tags: vec![],
            layers: vec![],
            config: RuntimeDefaults {
                env: vec!["APP=image".into(), "PATH=/bin".into()],
                ..Default::default()
            },
            size: 0,
            created_at: Utc::now(),
        };
        let mut options = ContainerOptions {
            image: "x".into(),
            ..Default::default()
        };
        options.env.insert("APP".into(), "user".into());
        let record = ContainerRecord::new(options);

        let env = NativeEngine::compute_env(&record, &image);
        assert!(env.contains(&"APP=user".to_string()));
        assert!(env.contains(&"PATH=/bin".to_string()));
    }
}
