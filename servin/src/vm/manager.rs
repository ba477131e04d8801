//! Guest VM lifecycle.
//!
//! One long-running Linux guest per host. Provisioning synthesizes a
//! cloud-init style seed ISO (root credentials, SSH daemon, a minimal
//! container toolchain) next to the disk image; the provider process is a
//! detached qemu with user-mode networking forwarding the SSH and docker
//! ports. `ensure_running` is the contract every VM-mode operation relies
//! on: it blocks until SSH answers or fails with `VM_UNAVAILABLE`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::errors::{ServinError, ServinResult};
use crate::runtime::layout::FilesystemLayout;
use crate::store::{atomic_write_json, load_json};
use crate::util::is_process_alive;
use crate::vm::config::{VmConfig, VmDistro, VmProvider};

const ENSURE_RUNNING_TIMEOUT: Duration = Duration::from_secs(90);
const SSH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Guest lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    #[default]
    NotCreated,
    Creating,
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Snapshot of the guest embedded into VM-mode operation results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub provider: String,
    pub state: VmState,
    pub ip: String,
    pub ssh_port: u16,
    pub docker_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedVmState {
    state: VmState,
    #[serde(default)]
    pid: u32,
}

/// Manages the single guest VM.
pub struct VmManager {
    layout: FilesystemLayout,
    config: VmConfig,
    state: Mutex<PersistedVmState>,
}

impl VmManager {
    pub fn new(layout: FilesystemLayout, config: VmConfig) -> ServinResult<Self> {
        let persisted: PersistedVmState =
            load_json(&layout.vm_dir().join("state.json"))?.unwrap_or_default();
        Ok(Self {
            layout,
            config,
            state: Mutex::new(persisted),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    fn state_path(&self) -> PathBuf {
        self.layout.vm_dir().join("state.json")
    }

    fn disk_path(&self) -> PathBuf {
        self.layout.vm_dir().join("disk").join("disk.qcow2")
    }

    fn image_path(&self) -> PathBuf {
        self.layout.vm_dir().join("image").join("base.qcow2")
    }

    fn seed_iso_path(&self) -> PathBuf {
        self.layout.vm_dir().join("seed").join("seed.iso")
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.layout.vm_dir().join("ssh").join("id_ed25519")
    }

    fn set_state(&self, mutate: impl FnOnce(&mut PersistedVmState)) -> ServinResult<VmState> {
        let mut state = self.state.lock();
        mutate(&mut state);
        atomic_write_json(&self.state_path(), &*state)?;
        Ok(state.state)
    }

    /// Current state, reconciled against the provider process.
    pub fn state(&self) -> VmState {
        let mut state = self.state.lock();
        if state.state == VmState::Running && !is_process_alive(state.pid) {
            state.state = VmState::Stopped;
            state.pid = 0;
            let _ = atomic_write_json(&self.state_path(), &*state);
        }
        state.state
    }

    /// Snapshot for embedding into operation results.
    pub fn info(&self) -> VmInfo {
        VmInfo {
            name: self.config.name.clone(),
            provider: self.config.provider.as_str().to_string(),
            state: self.state(),
            ip: "127.0.0.1".to_string(),
            ssh_port: self.config.ssh_port,
            docker_port: self.config.docker_port,
        }
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    /// Create disk, SSH key and seed ISO. Idempotent.
    pub async fn provision(&self) -> ServinResult<()> {
        if self.disk_path().exists() && self.seed_iso_path().exists() {
            return Ok(());
        }
        self.set_state(|s| s.state = VmState::Creating)?;
        tracing::info!(vm = %self.config.name, distro = ?self.config.distro, "provisioning guest");

        for dir in ["disk", "image", "seed", "ssh"] {
            tokio::fs::create_dir_all(self.layout.vm_dir().join(dir)).await?;
        }

        self.fetch_base_image().await?;
        self.create_disk().await?;
        self.generate_ssh_key().await?;
        self.write_seed_iso().await?;

        self.set_state(|s| s.state = VmState::Stopped)?;
        Ok(())
    }

    fn base_image_url(&self) -> &'static str {
        match self.config.distro {
            VmDistro::Alpine => {
                "https://dl-cdn.alpinelinux.org/alpine/v3.20/releases/cloud/nocloud_alpine-3.20.3-x86_64-uefi-cloudinit-r0.qcow2"
            }
            VmDistro::Ubuntu => {
                "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"
            }
            VmDistro::Debian => {
                "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-genericcloud-amd64.qcow2"
            }
        }
    }

    async fn fetch_base_image(&self) -> ServinResult<()> {
        let path = self.image_path();
        if path.exists() {
            return Ok(());
        }
        let url = self.base_image_url();
        tracing::info!(url, "downloading guest base image");

        let response = reqwest::get(url)
            .await
            .map_err(|e| ServinError::VmUnavailable(format!("image download: {e}")))?;
        if !response.status().is_success() {
            return Err(ServinError::VmUnavailable(format!(
                "image download failed: HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServinError::VmUnavailable(format!("image download: {e}")))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn create_disk(&self) -> ServinResult<()> {
        if self.disk_path().exists() {
            return Ok(());
        }
        let output = Command::new("qemu-img")
            .arg("create")
            .arg("-f")
            .arg("qcow2")
            .arg("-F")
            .arg("qcow2")
            .arg("-b")
            .arg(self.image_path())
            .arg(self.disk_path())
            .arg(format!("{}G", self.config.disk_gb))
            .output()
            .await
            .map_err(|e| ServinError::VmUnavailable(format!("qemu-img: {e}")))?;
        if !output.status.success() {
            return Err(ServinError::VmUnavailable(format!(
                "qemu-img create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn generate_ssh_key(&self) -> ServinResult<()> {
        let key = self.ssh_key_path();
        if key.exists() {
            return Ok(());
        }
        let output = Command::new("ssh-keygen")
            .arg("-t")
            .arg("ed25519")
            .arg("-N")
            .arg("")
            .arg("-f")
            .arg(&key)
            .output()
            .await
            .map_err(|e| ServinError::VmUnavailable(format!("ssh-keygen: {e}")))?;
        if !output.status.success() {
            return Err(ServinError::VmUnavailable(format!(
                "ssh-keygen failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Seed ISO with user-data/meta-data: root password, SSH key, and the
    /// in-guest container toolchain.
    async fn write_seed_iso(&self) -> ServinResult<()> {
        let seed_dir = self.layout.vm_dir().join("seed");
        let pubkey = tokio::fs::read_to_string(self.ssh_key_path().with_extension("pub")).await?;

        let toolchain = match self.config.distro {
            VmDistro::Alpine => "apk add --no-cache docker openssh && rc-update add docker && service docker start",
            VmDistro::Ubuntu | VmDistro::Debian => {
                "apt-get update && apt-get install -y docker.io openssh-server && systemctl enable --now docker"
            }
        };
        let user_data = format!(
            "#cloud-config\n\
             hostname: {name}\n\
             disable_root: false\n\
             chpasswd:\n  expire: false\n  list: |\n    root:servin\n\
             ssh_authorized_keys:\n  - {pubkey}\n\
             runcmd:\n\
               - {toolchain}\n\
               - sed -i 's/#PermitRootLogin.*/PermitRootLogin prohibit-password/' /etc/ssh/sshd_config\n\
               - dockerd -H tcp://0.0.0.0:2375 --tls=false &\n",
            name = self.config.name,
            pubkey = pubkey.trim(),
        );
        let meta_data = format!(
            "instance-id: {name}\nlocal-hostname: {name}\n",
            name = self.config.name
        );
        tokio::fs::write(seed_dir.join("user-data"), user_data).await?;
        tokio::fs::write(seed_dir.join("meta-data"), meta_data).await?;

        let output = Command::new("genisoimage")
            .arg("-output")
            .arg(self.seed_iso_path())
            .arg("-volid")
            .arg("cidata")
            .arg("-joliet")
            .arg("-rock")
            .arg(seed_dir.join("user-data"))
            .arg(seed_dir.join("meta-data"))
            .output()
            .await
            .map_err(|e| ServinError::VmUnavailable(format!("genisoimage: {e}")))?;
        if !output.status.success() {
            return Err(ServinError::VmUnavailable(format!(
                "seed iso generation failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Launch the provider process if not already running.
    pub async fn start(&self) -> ServinResult<()> {
        if self.state() == VmState::Running {
            return Ok(());
        }
        self.provision().await?;
        self.set_state(|s| s.state = VmState::Starting)?;

        let accel = match self.config.provider {
            VmProvider::Kvm => "kvm",
            VmProvider::Hvf => "hvf",
            _ => "tcg",
        };
        let pid_file = self.layout.vm_dir().join("vm.pid");
        let netdev = format!(
            "user,id=n0,hostfwd=tcp:127.0.0.1:{}-:22,hostfwd=tcp:127.0.0.1:{}-:2375",
            self.config.ssh_port, self.config.docker_port
        );

        let output = Command::new("qemu-system-x86_64")
            .arg("-machine")
            .arg(format!("q35,accel={accel}"))
            .arg("-smp")
            .arg(self.config.cpus.to_string())
            .arg("-m")
            .arg(self.config.memory_mb.to_string())
            .arg("-drive")
            .arg(format!("file={},if=virtio", self.disk_path().display()))
            .arg("-cdrom")
            .arg(self.seed_iso_path())
            .arg("-netdev")
            .arg(netdev)
            .arg("-device")
            .arg("virtio-net-pci,netdev=n0")
            .arg("-display")
            .arg("none")
            .arg("-daemonize")
            .arg("-pidfile")
            .arg(&pid_file)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ServinError::VmUnavailable(format!("qemu-system-x86_64: {e}")))?;
        if !output.status.success() {
            self.set_state(|s| s.state = VmState::Stopped)?;
            return Err(ServinError::VmUnavailable(format!(
                "provider failed to launch: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let pid = tokio::fs::read_to_string(&pid_file)
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        self.set_state(|s| {
            s.state = VmState::Running;
            s.pid = pid;
        })?;
        tracing::info!(vm = %self.config.name, pid, "guest started");
        Ok(())
    }

    /// Block until the guest answers over SSH, with a bounded timeout.
    pub async fn ensure_running(&self) -> ServinResult<VmInfo> {
        if self.state() != VmState::Running {
            self.start().await?;
        }

        let deadline = tokio::time::Instant::now() + ENSURE_RUNNING_TIMEOUT;
        let mut last_error = String::from("no attempt made");
        loop {
            match self.ssh_exec(&["true"]).await {
                Ok(output) if output.status.success() => {
                    return Ok(self.info());
                }
                Ok(output) => {
                    last_error = String::from_utf8_lossy(&output.stderr).trim().to_string();
                }
                Err(e) => last_error = e.to_string(),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ServinError::VmUnavailable(format!(
                    "guest {} did not answer on port {} within {}s: {last_error}",
                    self.config.name,
                    self.config.ssh_port,
                    ENSURE_RUNNING_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(SSH_POLL_INTERVAL).await;
        }
    }

    /// Graceful guest shutdown, then reap the provider process.
    pub async fn stop(&self) -> ServinResult<()> {
        if self.state() != VmState::Running {
            return Ok(());
        }
        self.set_state(|s| s.state = VmState::Stopping)?;
        let _ = self.ssh_exec(&["poweroff"]).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let pid = self.state.lock().pid;
        if pid != 0 && is_process_alive(pid) {
            crate::util::kill_process(pid);
        }
        self.set_state(|s| {
            s.state = VmState::Stopped;
            s.pid = 0;
        })?;
        tracing::info!(vm = %self.config.name, "guest stopped");
        Ok(())
    }

    /// Destroy disk and seed; the next start provisions from scratch.
    pub async fn reset(&self) -> ServinResult<()> {
        self.stop().await?;
        for dir in ["disk", "seed"] {
            let path = self.layout.vm_dir().join(dir);
            if path.exists() {
                tokio::fs::remove_dir_all(&path).await?;
            }
        }
        self.set_state(|s| *s = PersistedVmState::default())?;
        Ok(())
    }

    /// Run a command inside the guest over SSH.
    pub async fn ssh_exec(&self, argv: &[&str]) -> ServinResult<std::process::Output> {
        let mut command = Command::new("ssh");
        command
            .arg("-i")
            .arg(self.ssh_key_path())
            .arg("-p")
            .arg(self.config.ssh_port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("ConnectTimeout=5")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("root@127.0.0.1")
            .arg("--")
            .args(argv)
            .stdin(Stdio::null());
        command
            .output()
            .await
            .map_err(|e| ServinError::VmUnavailable(format!("ssh: {e}")))
    }
}
