//! Servin: a lightweight container runtime core.
//!
//! The crate wires four subsystems together: the container engine (Linux
//! namespaces, cgroups, pivoted rootfs, bridge networking), the
//! content-addressed image store with tarball import/export and a Buildfile
//! builder, the VM-mode manager that substitutes a managed Linux guest on
//! hosts without native isolation, and the CRI server translating
//! Kubernetes pod/container/image requests onto the engine. A registry-v2
//! compatible local registry serves the image store over HTTP.
//!
//! Most applications go through [`ServinRuntime`]:
//!
//! ```no_run
//! use servin::{ContainerOptions, ServinRuntime};
//!
//! # async fn example() -> servin::ServinResult<()> {
//! let runtime = ServinRuntime::with_defaults()?;
//! let record = runtime
//!     .create_container(ContainerOptions {
//!         image: "alpine:latest".into(),
//!         command: vec!["echo".into(), "hello".into()],
//!         ..Default::default()
//!     })
//!     .await?;
//! runtime.start_container(record.id.as_str()).await?;
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod cri;
pub mod errors;
pub mod images;
pub mod isolation;
pub mod logging;
pub mod network;
pub mod registry;
pub mod rootfs;
pub mod runtime;
pub mod store;
pub mod util;
pub mod vm;
pub mod volumes;

pub use container::{ContainerFilter, LogQuery, NativeEngine};
pub use errors::{ServinError, ServinResult};
pub use images::{BuildOptions, ImageRecord, ImageReference, ImageStore};
pub use runtime::{
    ContainerId, ContainerOptions, ContainerRecord, ContainerRuntime, ContainerStatus,
    ExecResult, FilesystemLayout, NetworkMode, ServinOptions, ServinRuntime,
};
pub use store::{PodSandboxRecord, VolumeRecord};
pub use vm::{VmConfig, VmManager, VmState};
