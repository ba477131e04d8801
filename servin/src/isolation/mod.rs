//! Thin abstractions over the host's isolation primitives: namespaces and
//! control groups. Networking lives in [`crate::network`].

mod cgroup;
mod namespaces;

pub use cgroup::{Cgroup, CgroupLimits, CgroupStats, DEFAULT_PIDS_MAX};
pub use namespaces::{BindMount, InitConfig, SpawnedInit, UserNsMapping, spawn_container_init};
