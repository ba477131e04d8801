//! Namespace creation and the in-container init sequence.
//!
//! A container's init process is spawned with one `clone(2)` carrying all
//! requested namespace flags. Inside the new namespaces the child waits on a
//! pipe barrier (so the host can attach the veth first), then sets the
//! hostname, mounts /proc and /sys, pivots into the prepared rootfs, applies
//! capability drops and the no-new-privileges bit, and finally execs the
//! configured command. A close-on-exec error pipe reports setup failures back
//! to the supervisor; EOF on it means the exec happened.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use crate::errors::{ServinError, ServinResult};
use crate::runtime::types::NetworkMode;

/// Everything the init process needs, resolved before the clone.
#[derive(Debug, Clone)]
pub struct InitConfig {
    pub rootfs: PathBuf,
    pub hostname: String,
    pub working_dir: String,
    /// argv[0] is the executable; looked up on PATH when not absolute.
    pub argv: Vec<String>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    pub network_mode: NetworkMode,
    /// Host paths bind-mounted into the rootfs before the pivot.
    pub binds: Vec<BindMount>,
    /// Drop all capabilities except a minimal keep set.
    pub drop_capabilities: bool,
    pub no_new_privileges: bool,
    /// Map the calling uid/gid to root inside a new user namespace.
    pub userns: Option<UserNsMapping>,
}

/// A host directory mounted into the container.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: PathBuf,
    /// Absolute path inside the container.
    pub target: String,
    pub read_only: bool,
}

/// Uid/gid range mapped into a user namespace (rootless mode).
#[derive(Debug, Clone, Copy)]
pub struct UserNsMapping {
    pub host_uid: u32,
    pub host_gid: u32,
    pub range: u32,
}

/// Handles held by the supervisor after a successful spawn.
pub struct SpawnedInit {
    pub pid: u32,
    /// Read end of the child's stdout.
    pub stdout: OwnedFd,
    /// Read end of the child's stderr.
    pub stderr: OwnedFd,
    /// Write end of the barrier pipe; writing one byte releases the child
    /// into its exec.
    barrier: OwnedFd,
    /// Read end of the close-on-exec error pipe.
    error_rx: OwnedFd,
}

impl SpawnedInit {
    /// Release the child past the barrier and wait for the exec outcome.
    ///
    /// Returns `Isolation` when the child reported a setup failure instead of
    /// reaching its exec.
    pub fn release(self) -> ServinResult<(OwnedFd, OwnedFd)> {
        let byte = [1u8];
        let n = unsafe { libc::write(self.barrier.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if n != 1 {
            return Err(ServinError::Isolation(
                "failed to release init barrier".into(),
            ));
        }
        drop(self.barrier);

        let mut buf = [0u8; 512];
        let n = unsafe {
            libc::read(
                self.error_rx.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n > 0 {
            let msg = String::from_utf8_lossy(&buf[..n as usize]).into_owned();
            return Err(ServinError::Isolation(msg));
        }
        Ok((self.stdout, self.stderr))
    }
}

#[cfg(target_os = "linux")]
pub use linux::spawn_container_init;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::sched::{CloneFlags, clone};
    use nix::unistd::{chdir, execvpe, pivot_root, sethostname};

    const STACK_SIZE: usize = 1024 * 1024;
    const PUT_OLD: &str = ".servin-old-root";

    fn make_pipe() -> ServinResult<(OwnedFd, OwnedFd)> {
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| ServinError::Isolation(format!("pipe: {e}")))
    }

    /// Clone the init process with the namespace set the config requires.
    ///
    /// The returned [`SpawnedInit`] is still parked before its exec; the
    /// caller attaches networking and then calls
    /// [`release`](SpawnedInit::release).
    pub fn spawn_container_init(config: &InitConfig) -> ServinResult<SpawnedInit> {
        let (stdout_rx, stdout_tx) = make_pipe()?;
        let (stderr_rx, stderr_tx) = make_pipe()?;
        let (barrier_rx, barrier_tx) = make_pipe()?;
        let (error_rx, error_tx) = make_pipe()?;

        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWPID;
        if matches!(config.network_mode, NetworkMode::Bridge | NetworkMode::None) {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if config.userns.is_some() {
            flags |= CloneFlags::CLONE_NEWUSER;
        }

        let child_config = config.clone();
        let stdout_fd = stdout_tx.as_raw_fd();
        let stderr_fd = stderr_tx.as_raw_fd();
        let barrier_fd = barrier_rx.as_raw_fd();
        let error_fd = error_tx.as_raw_fd();

        let mut stack = vec![0u8; STACK_SIZE];
        let cb = Box::new(move || {
            init_child(&child_config, stdout_fd, stderr_fd, barrier_fd, error_fd)
        });

        let pid = unsafe { clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }
            .map_err(|e| ServinError::Isolation(format!("clone: {e}")))?;

        // Parent side keeps the read ends and the barrier write end.
        drop(stdout_tx);
        drop(stderr_tx);
        drop(barrier_rx);
        drop(error_tx);

        if let Some(mapping) = &config.userns {
            write_id_maps(pid.as_raw() as u32, mapping)?;
        }

        Ok(SpawnedInit {
            pid: pid.as_raw() as u32,
            stdout: stdout_rx,
            stderr: stderr_rx,
            barrier: barrier_tx,
            error_rx,
        })
    }

    fn write_id_maps(pid: u32, mapping: &UserNsMapping) -> ServinResult<()> {
        let uid_map = format!("0 {} {}\n", mapping.host_uid, mapping.range);
        let gid_map = format!("0 {} {}\n", mapping.host_gid, mapping.range);
        std::fs::write(format!("/proc/{pid}/setgroups"), "deny")
            .map_err(|e| ServinError::Isolation(format!("setgroups: {e}")))?;
        std::fs::write(format!("/proc/{pid}/uid_map"), uid_map)
            .map_err(|e| ServinError::Isolation(format!("uid_map: {e}")))?;
        std::fs::write(format!("/proc/{pid}/gid_map"), gid_map)
            .map_err(|e| ServinError::Isolation(format!("gid_map: {e}")))?;
        Ok(())
    }

    /// Runs inside the cloned child. Returns the exit code for clone(2); on
    /// success execvpe never returns.
    fn init_child(
        config: &InitConfig,
        stdout_fd: RawFd,
        stderr_fd: RawFd,
        barrier_fd: RawFd,
        error_fd: RawFd,
    ) -> isize {
        match init_child_inner(config, stdout_fd, stderr_fd, barrier_fd) {
            Ok(()) => 0, // unreachable: exec replaces the image
            Err(msg) => {
                let bytes = msg.as_bytes();
                unsafe {
                    libc::write(error_fd, bytes.as_ptr().cast(), bytes.len());
                }
                127
            }
        }
    }

    fn init_child_inner(
        config: &InitConfig,
        stdout_fd: RawFd,
        stderr_fd: RawFd,
        barrier_fd: RawFd,
    ) -> Result<(), String> {
        // Wait until the host has attached networking.
        let mut byte = [0u8; 1];
        let n = unsafe { libc::read(barrier_fd, byte.as_mut_ptr().cast(), 1) };
        if n != 1 {
            return Err("init barrier closed before release".into());
        }

        // Route the workload's stdio into the capture pipes.
        if unsafe { libc::dup2(stdout_fd, libc::STDOUT_FILENO) } < 0 {
            return Err("dup2 stdout failed".into());
        }
        if unsafe { libc::dup2(stderr_fd, libc::STDERR_FILENO) } < 0 {
            return Err("dup2 stderr failed".into());
        }

        sethostname(&config.hostname).map_err(|e| format!("sethostname: {e}"))?;

        setup_rootfs(config).map_err(|e| format!("rootfs: {e}"))?;

        if config.drop_capabilities {
            drop_capabilities().map_err(|e| format!("capabilities: {e}"))?;
        }
        if config.no_new_privileges {
            let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
            if rc != 0 {
                return Err("prctl(PR_SET_NO_NEW_PRIVS) failed".into());
            }
        }

        let workdir = if config.working_dir.is_empty() {
            "/"
        } else {
            &config.working_dir
        };
        std::fs::create_dir_all(workdir).map_err(|e| format!("workdir {workdir}: {e}"))?;
        chdir(workdir).map_err(|e| format!("chdir {workdir}: {e}"))?;

        let argv: Vec<CString> = config
            .argv
            .iter()
            .map(|a| CString::new(a.as_str()).map_err(|_| format!("NUL in argv: {a:?}")))
            .collect::<Result<_, _>>()?;
        let env: Vec<CString> = config
            .env
            .iter()
            .map(|e| CString::new(e.as_str()).map_err(|_| format!("NUL in env: {e:?}")))
            .collect::<Result<_, _>>()?;
        let program = argv
            .first()
            .cloned()
            .ok_or_else(|| "empty command".to_string())?;

        execvpe(&program, &argv, &env).map_err(|e| format!("exec {:?}: {e}", config.argv[0]))?;
        Ok(())
    }

    fn setup_rootfs(config: &InitConfig) -> Result<(), String> {
        let rootfs = &config.rootfs;

        // Stop mount events from leaking back to the host.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("make / private: {e}"))?;

        // pivot_root needs the new root to be a mount point.
        mount(
            Some(rootfs),
            rootfs,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("bind rootfs: {e}"))?;

        for bind in &config.binds {
            let target = rootfs.join(bind.target.trim_start_matches('/'));
            std::fs::create_dir_all(&target)
                .map_err(|e| format!("bind target {}: {e}", target.display()))?;
            mount(
                Some(&bind.source),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| format!("bind {}: {e}", bind.source.display()))?;
            if bind.read_only {
                mount(
                    None::<&str>,
                    &target,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
                .map_err(|e| format!("remount ro {}: {e}", target.display()))?;
            }
        }

        let put_old = rootfs.join(PUT_OLD);
        std::fs::create_dir_all(&put_old).map_err(|e| format!("put_old dir: {e}"))?;

        chdir(rootfs).map_err(|e| format!("chdir rootfs: {e}"))?;
        pivot_root(".", PUT_OLD).map_err(|e| format!("pivot_root: {e}"))?;
        chdir("/").map_err(|e| format!("chdir /: {e}"))?;

        let old = format!("/{PUT_OLD}");
        umount2(old.as_str(), MntFlags::MNT_DETACH).map_err(|e| format!("umount old root: {e}"))?;
        std::fs::remove_dir_all(&old).ok();

        for dir in ["/proc", "/sys", "/dev"] {
            std::fs::create_dir_all(dir).map_err(|e| format!("mkdir {dir}: {e}"))?;
        }
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| format!("mount /proc: {e}"))?;
        mount(
            Some("sysfs"),
            "/sys",
            Some("sysfs"),
            MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| format!("mount /sys: {e}"))?;
        mount(
            Some("tmpfs"),
            "/dev",
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=755"),
        )
        .map_err(|e| format!("mount /dev: {e}"))?;

        Ok(())
    }

    /// Drop every bounding capability except a minimal keep set.
    fn drop_capabilities() -> Result<(), String> {
        use caps::{CapSet, Capability};

        let keep = [
            Capability::CAP_AUDIT_WRITE,
            Capability::CAP_KILL,
            Capability::CAP_NET_BIND_SERVICE,
        ];
        for cap in caps::all() {
            if keep.contains(&cap) {
                continue;
            }
            caps::drop(None, CapSet::Bounding, cap).map_err(|e| format!("drop {cap}: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn spawn_container_init(_config: &InitConfig) -> ServinResult<SpawnedInit> {
    Err(ServinError::Isolation(
        "native namespaces are only available on Linux hosts".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_config_defaults_are_inert() {
        let config = InitConfig {
            rootfs: PathBuf::from("/tmp/rootfs"),
            hostname: "c1".into(),
            working_dir: String::new(),
            argv: vec!["/bin/true".into()],
            env: vec![],
            network_mode: NetworkMode::None,
            binds: vec![],
            drop_capabilities: false,
            no_new_privileges: false,
            userns: None,
        };
        assert_eq!(config.argv.len(), 1);
        assert!(config.userns.is_none());
    }
}
