//! Cgroup v2 leaf management.
//!
//! Each container gets its own leaf under `/sys/fs/cgroup/servin/<id>`.
//! Supported knobs: `memory.max`, `pids.max` (defaults to 1024 so a fork
//! bomb cannot take the host down) and `cpu.max` derived from fractional
//! cores. A missing or unwritable controller downgrades to a WARN — the
//! container still starts, it just runs unconfined.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ServinError, ServinResult};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const PARENT: &str = "servin";
const CPU_PERIOD_USEC: u64 = 100_000;

/// Default pids.max applied to every container.
pub const DEFAULT_PIDS_MAX: u64 = 1024;

/// Resource knobs applied to a leaf.
#[derive(Debug, Clone, Copy)]
pub struct CgroupLimits {
    /// memory.max in bytes; `None` leaves the controller at `max`.
    pub memory_max: Option<u64>,
    pub pids_max: u64,
    /// Fractional cores translated to `cpu.max` quota/period.
    pub cpu_cores: Option<f64>,
}

impl Default for CgroupLimits {
    fn default() -> Self {
        Self {
            memory_max: None,
            pids_max: DEFAULT_PIDS_MAX,
            cpu_cores: None,
        }
    }
}

/// Resource readings from a leaf's usage counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CgroupStats {
    pub memory_current: u64,
    pub memory_peak: u64,
    pub cpu_usage_usec: u64,
    pub pids_current: u64,
}

/// One container's cgroup leaf.
#[derive(Debug, Clone)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create the leaf and apply limits. Returns `Ok(None)` with a WARN when
    /// the cgroup filesystem is unavailable (the failure does not prevent
    /// process startup).
    pub fn create(id: &str, limits: &CgroupLimits) -> ServinResult<Option<Self>> {
        let root = Path::new(CGROUP_ROOT);
        if !root.join("cgroup.controllers").exists() {
            tracing::warn!(
                container = id,
                "cgroup v2 unavailable, starting without resource limits"
            );
            return Ok(None);
        }

        let path = root.join(PARENT).join(id);
        if let Err(e) = std::fs::create_dir_all(&path) {
            tracing::warn!(
                container = id,
                error = %e,
                "cannot create cgroup leaf, starting without resource limits"
            );
            return Ok(None);
        }

        // Delegate the controllers we use to the leaf level.
        let subtree = root.join(PARENT).join("cgroup.subtree_control");
        if let Err(e) = std::fs::write(&subtree, "+memory +pids +cpu") {
            tracing::warn!(error = %e, "cannot enable cgroup controllers");
        }

        let leaf = Self { path };
        leaf.apply(limits);
        Ok(Some(leaf))
    }

    fn apply(&self, limits: &CgroupLimits) {
        if let Some(memory) = limits.memory_max {
            self.write_knob("memory.max", &memory.to_string());
        }
        self.write_knob("pids.max", &limits.pids_max.to_string());
        if let Some(cores) = limits.cpu_cores {
            if cores > 0.0 {
                let quota = (cores * CPU_PERIOD_USEC as f64) as u64;
                self.write_knob("cpu.max", &format!("{quota} {CPU_PERIOD_USEC}"));
            }
        }
    }

    /// Write a single knob; failures downgrade to WARN.
    fn write_knob(&self, knob: &str, value: &str) {
        let path = self.path.join(knob);
        if let Err(e) = std::fs::write(&path, value) {
            tracing::warn!(knob, value, error = %e, "cgroup knob not applied");
        }
    }

    /// Move a process into the leaf.
    pub fn add_process(&self, pid: u32) -> ServinResult<()> {
        std::fs::write(self.path.join("cgroup.procs"), pid.to_string())
            .map_err(|e| ServinError::Isolation(format!("cgroup.procs: {e}")))
    }

    /// Read usage counters from the leaf.
    pub fn stats(&self) -> CgroupStats {
        let mut stats = CgroupStats::default();
        stats.memory_current = self.read_counter("memory.current");
        stats.memory_peak = self.read_counter("memory.peak");
        stats.pids_current = self.read_counter("pids.current");

        if let Ok(content) = std::fs::read_to_string(self.path.join("cpu.stat")) {
            for line in content.lines() {
                if let Some(value) = line.strip_prefix("usage_usec ") {
                    stats.cpu_usage_usec = value.trim().parse().unwrap_or(0);
                }
            }
        }
        stats
    }

    fn read_counter(&self, knob: &str) -> u64 {
        std::fs::read_to_string(self.path.join(knob))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Remove the (empty) leaf. Idempotent; failures are logged only.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "cgroup leaf not removed");
            }
        }
    }

    /// Reattach to an existing leaf (after runtime restart).
    pub fn attach(id: &str) -> Option<Self> {
        let path = Path::new(CGROUP_ROOT).join(PARENT).join(id);
        path.is_dir().then_some(Self { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_guard_against_fork_bombs() {
        let limits = CgroupLimits::default();
        assert_eq!(limits.pids_max, DEFAULT_PIDS_MAX);
        assert!(limits.memory_max.is_none());
    }

    #[test]
    fn test_cpu_quota_translation() {
        // 1.5 cores -> 150000/100000.
        let quota = (1.5 * CPU_PERIOD_USEC as f64) as u64;
        assert_eq!(quota, 150_000);
    }

    #[test]
    fn test_attach_missing_leaf_is_none() {
        assert!(Cgroup::attach("no-such-container-zzz").is_none());
    }
}
