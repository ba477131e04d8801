//! Port mappings via destination NAT.
//!
//! Each mapping becomes a pair of iptables rules (PREROUTING for external
//! traffic, OUTPUT for host-local traffic). Rule specs are derived purely
//! from the container address and the mapping, so teardown replays the same
//! specs with `-D`.

use std::net::Ipv4Addr;
use std::process::Command;

use crate::errors::{ServinError, ServinResult};
use crate::runtime::types::PortMapping;

fn iptables(action: &str, rule: &[String]) -> ServinResult<()> {
    let output = Command::new("iptables")
        .arg("-t")
        .arg("nat")
        .arg(action)
        .args(rule)
        .output()
        .map_err(|e| ServinError::Isolation(format!("iptables: {e}")))?;
    if !output.status.success() {
        return Err(ServinError::Isolation(format!(
            "iptables {action} {} failed: {}",
            rule.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn rules_for(container_ip: Ipv4Addr, mapping: &PortMapping) -> Vec<Vec<String>> {
    let proto = mapping.protocol.as_str().to_string();
    let host_port = mapping.host_port.to_string();
    let dest = format!("{container_ip}:{}", mapping.container_port);
    vec![
        vec![
            "PREROUTING".into(),
            "-p".into(),
            proto.clone(),
            "--dport".into(),
            host_port.clone(),
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            dest.clone(),
        ],
        vec![
            "OUTPUT".into(),
            "-o".into(),
            "lo".into(),
            "-p".into(),
            proto,
            "--dport".into(),
            host_port,
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            dest,
        ],
    ]
}

/// Install DNAT rules for every mapping. Already-applied rules roll back on
/// the first failure so a failed start leaves no stale NAT state.
pub fn apply_port_mappings(
    container_ip: Ipv4Addr,
    mappings: &[PortMapping],
) -> ServinResult<()> {
    let mut applied: Vec<Vec<String>> = Vec::new();
    for mapping in mappings {
        for rule in rules_for(container_ip, mapping) {
            if let Err(e) = iptables("-A", &rule) {
                for done in applied.iter().rev() {
                    let _ = iptables("-D", done);
                }
                return Err(e);
            }
            applied.push(rule);
        }
    }
    Ok(())
}

/// Remove the DNAT rules for every mapping. Idempotent; missing rules are
/// logged only.
pub fn remove_port_mappings(container_ip: Ipv4Addr, mappings: &[PortMapping]) {
    for mapping in mappings {
        for rule in rules_for(container_ip, mapping) {
            if let Err(e) = iptables("-D", &rule) {
                tracing::debug!(error = %e, "nat rule already removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::types::Protocol;

    #[test]
    fn test_rule_specs_are_deterministic() {
        let ip: Ipv4Addr = "10.88.0.2".parse().unwrap();
        let mapping = PortMapping {
            host_port: 8080,
            container_port: 80,
            protocol: Protocol::Tcp,
        };
        let first = rules_for(ip, &mapping);
        let second = rules_for(ip, &mapping);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first[0].contains(&"DNAT".to_string()));
        assert!(first[0].contains(&"10.88.0.2:80".to_string()));
    }
}
