//! Managed bridge and veth attachment.
//!
//! The default bridge `servin0` is created on first use. Attaching a
//! container means: create a veth pair, enslave the host end to the bridge,
//! move the peer into the container's network namespace, assign the
//! IPAM-allocated address and default route there, and bring loopback up.
//! All link operations go through ip(8)/nsenter(8), the same way the rest of
//! the runtime drives host tooling.

use std::net::Ipv4Addr;
use std::process::Command;

use crate::errors::{ServinError, ServinResult};

/// Name of the default managed bridge.
pub const DEFAULT_BRIDGE: &str = "servin0";

/// Default IPv4 subnet for the managed bridge.
pub const DEFAULT_SUBNET: &str = "10.88.0.0/16";

fn run(tool: &str, args: &[&str]) -> ServinResult<String> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| ServinError::Isolation(format!("{tool} {}: {e}", args.join(" "))))?;
    if !output.status.success() {
        return Err(ServinError::Isolation(format!(
            "{tool} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Interface names derived from a container id. Kernel interface names are
/// capped at 15 bytes, so only an id prefix is used.
fn veth_names(container_id: &str) -> (String, String) {
    let prefix = &container_id[..container_id.len().min(8)];
    (format!("sv-{prefix}"), format!("svp-{prefix}"))
}

/// Host-side bridge operations.
#[derive(Debug, Clone)]
pub struct Bridge {
    name: String,
    gateway: Ipv4Addr,
    prefix_len: u8,
}

impl Bridge {
    pub fn new(name: &str, gateway: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            name: name.to_string(),
            gateway,
            prefix_len,
        }
    }

    /// Create the bridge device and assign the gateway address, if it does
    /// not exist yet.
    pub fn ensure(&self) -> ServinResult<()> {
        let sys = format!("/sys/class/net/{}", self.name);
        if std::path::Path::new(&sys).exists() {
            return Ok(());
        }
        tracing::info!(bridge = %self.name, gateway = %self.gateway, "creating bridge");
        run("ip", &["link", "add", "name", &self.name, "type", "bridge"])?;
        run(
            "ip",
            &[
                "addr",
                "add",
                &format!("{}/{}", self.gateway, self.prefix_len),
                "dev",
                &self.name,
            ],
        )?;
        run("ip", &["link", "set", &self.name, "up"])?;
        Ok(())
    }

    /// Attach a container's network namespace to the bridge.
    ///
    /// `pid` is the container init process; its network namespace receives
    /// the peer end as `eth0` with `ip` assigned and the bridge as default
    /// gateway.
    pub fn attach(&self, container_id: &str, pid: u32, ip: Ipv4Addr) -> ServinResult<()> {
        let (host_end, peer_end) = veth_names(container_id);
        let pid_arg = pid.to_string();

        run(
            "ip",
            &[
                "link", "add", &host_end, "type", "veth", "peer", "name", &peer_end,
            ],
        )?;
        run("ip", &["link", "set", &host_end, "master", &self.name])?;
        run("ip", &["link", "set", &host_end, "up"])?;
        run("ip", &["link", "set", &peer_end, "netns", &pid_arg])?;

        let ns = |args: &[&str]| -> ServinResult<String> {
            let mut full = vec!["-t", &pid_arg, "-n", "--"];
            full.extend_from_slice(args);
            run("nsenter", &full)
        };
        ns(&["ip", "link", "set", &peer_end, "name", "eth0"])?;
        ns(&[
            "ip",
            "addr",
            "add",
            &format!("{ip}/{}", self.prefix_len),
            "dev",
            "eth0",
        ])?;
        ns(&["ip", "link", "set", "eth0", "up"])?;
        ns(&["ip", "link", "set", "lo", "up"])?;
        ns(&[
            "ip",
            "route",
            "add",
            "default",
            "via",
            &self.gateway.to_string(),
        ])?;

        tracing::debug!(container = container_id, %ip, "attached to bridge");
        Ok(())
    }

    /// Destroy a container's veth. Deleting the host end tears down the peer
    /// as well; a missing device is not an error.
    pub fn detach(&self, container_id: &str) {
        let (host_end, _) = veth_names(container_id);
        if let Err(e) = run("ip", &["link", "del", &host_end]) {
            tracing::debug!(container = container_id, error = %e, "veth already gone");
        }
    }
}

/// Bring loopback up inside a namespace that gets no other interface
/// (`none` network mode).
pub fn setup_loopback_only(pid: u32) -> ServinResult<()> {
    let pid_arg = pid.to_string();
    run(
        "nsenter",
        &["-t", &pid_arg, "-n", "--", "ip", "link", "set", "lo", "up"],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_veth_names_fit_interface_limit() {
        let (host, peer) = veth_names("0123456789abcdef0123456789abcdef");
        assert_eq!(host, "sv-01234567");
        assert_eq!(peer, "svp-01234567");
        assert!(host.len() <= 15);
        assert!(peer.len() <= 15);
    }

    #[test]
    fn test_veth_names_tolerate_short_ids() {
        let (host, peer) = veth_names("abc");
        assert_eq!(host, "sv-abc");
        assert_eq!(peer, "svp-abc");
    }
}
