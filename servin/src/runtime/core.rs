//! Runtime composition root.
//!
//! `ServinRuntime` wires the state store, image store, volume manager,
//! networking and the two container backends together, and routes every
//! container operation to the backend that owns it: VM-mode records go
//! through the guest, everything else through the native engine. The
//! backend is selected once at construction; a VM-mode failure falls back to
//! native with a WARN where the host supports it.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ipnet::Ipv4Net;

use crate::container::{ContainerFilter, ContainerManager, LogQuery, NativeEngine};
use crate::cri::{CriServer, DEFAULT_CRI_PORT};
use crate::errors::{ServinError, ServinResult};
use crate::images::ImageStore;
use crate::isolation::CgroupStats;
use crate::logging::init_logging_for;
use crate::network::{Bridge, DEFAULT_BRIDGE, DEFAULT_SUBNET, IpamPool};
use crate::registry::{RegistryConfig, RegistryServer};
use crate::runtime::backend::{ContainerRuntime, ExecResult};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::ContainerOptions;
use crate::runtime::types::{ContainerRecord, NetworkMode};
use crate::store::{ContainerStore, SandboxStore, VolumeStore};
use crate::vm::{VmConfig, VmManager, VmRuntime, vm_mode_enabled};
use crate::volumes::VolumeManager;

static DEFAULT_RUNTIME: OnceLock<ServinRuntime> = OnceLock::new();

/// Construction options.
#[derive(Debug, Clone)]
pub struct ServinOptions {
    pub base_dir: PathBuf,
    /// Override VM-mode detection; `None` keeps the detection rules.
    pub vm_mode: Option<bool>,
    pub bridge_name: String,
    pub bridge_subnet: Ipv4Net,
    pub cri_port: u16,
}

impl Default for ServinOptions {
    fn default() -> Self {
        Self {
            base_dir: FilesystemLayout::default_base_dir(),
            vm_mode: None,
            bridge_name: DEFAULT_BRIDGE.to_string(),
            bridge_subnet: DEFAULT_SUBNET.parse().expect("default subnet is valid"),
            cri_port: DEFAULT_CRI_PORT,
        }
    }
}

struct RuntimeInner {
    layout: FilesystemLayout,
    manager: ContainerManager,
    images: Arc<ImageStore>,
    volume_store: Arc<VolumeStore>,
    sandboxes: Arc<SandboxStore>,
    native: NativeEngine,
    vm: Option<Arc<VmRuntime>>,
    cri_port: u16,
}

/// Entry point for creating and managing containers, images and volumes.
///
/// Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct ServinRuntime {
    inner: Arc<RuntimeInner>,
}

impl ServinRuntime {
    /// Build a runtime from options. All filesystem preparation, recovery
    /// and backend selection completes before this returns.
    pub fn new(options: ServinOptions) -> ServinResult<Self> {
        if !options.base_dir.is_absolute() {
            return Err(ServinError::InvalidConfig(format!(
                "base_dir must be absolute, got {}",
                options.base_dir.display()
            )));
        }

        let layout = FilesystemLayout::new(options.base_dir.clone());
        layout.prepare()?;
        init_logging_for(&layout)?;

        let images = Arc::new(ImageStore::open(&layout)?);
        let volume_store = Arc::new(VolumeStore::new(&layout));
        let sandboxes = Arc::new(SandboxStore::new(&layout));

        let manager = ContainerManager::new(ContainerStore::new(&layout));
        manager.recover()?;

        let ipam = Arc::new(IpamPool::open(
            &layout,
            &options.bridge_name,
            options.bridge_subnet,
        )?);
        let bridge = Bridge::new(
            &options.bridge_name,
            ipam.gateway(),
            options.bridge_subnet.prefix_len(),
        );
        let native = NativeEngine::new(
            layout.clone(),
            manager.clone(),
            Arc::clone(&images),
            Arc::clone(&volume_store),
            bridge,
            ipam,
        );

        let use_vm = options.vm_mode.unwrap_or_else(|| vm_mode_enabled(&layout));
        let vm = if use_vm {
            let config = VmConfig::load(&layout)?;
            let vm_manager = Arc::new(VmManager::new(layout.clone(), config)?);
            Some(Arc::new(VmRuntime::new(vm_manager, manager.clone())))
        } else {
            None
        };

        tracing::info!(
            base = %layout.base_dir().display(),
            vm_mode = use_vm,
            "runtime initialized"
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                layout,
                manager,
                images,
                volume_store,
                sandboxes,
                native,
                vm,
                cri_port: options.cri_port,
            }),
        })
    }

    /// Runtime with default options.
    pub fn with_defaults() -> ServinResult<Self> {
        Self::new(ServinOptions::default())
    }

    /// Process-wide lazily initialized runtime.
    ///
    /// # Panics
    ///
    /// Panics if initialization fails (base directory unusable).
    pub fn default_runtime() -> &'static Self {
        DEFAULT_RUNTIME
            .get_or_init(|| Self::with_defaults().expect("failed to initialize default runtime"))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn layout(&self) -> &FilesystemLayout {
        &self.inner.layout
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.inner.images
    }

    pub fn volumes(&self) -> VolumeManager {
        VolumeManager::new(
            Arc::clone(&self.inner.volume_store),
            self.inner.manager.clone(),
        )
    }

    pub fn sandboxes(&self) -> &Arc<SandboxStore> {
        &self.inner.sandboxes
    }

    pub fn vm(&self) -> Option<Arc<VmManager>> {
        self.inner.vm.as_ref().map(|vm| Arc::clone(vm.vm()))
    }

    /// The backend container operations enter by default.
    fn default_backend(&self) -> Arc<dyn ContainerRuntime> {
        match &self.inner.vm {
            Some(vm) => Arc::clone(vm) as Arc<dyn ContainerRuntime>,
            None => Arc::new(self.inner.native.clone()),
        }
    }

    /// Route an operation on an existing container to the backend owning it.
    fn backend_for(&self, record: &ContainerRecord) -> ServinResult<Arc<dyn ContainerRuntime>> {
        if record.config.network_mode == NetworkMode::Vm {
            match &self.inner.vm {
                Some(vm) => Ok(Arc::clone(vm) as Arc<dyn ContainerRuntime>),
                None => Err(ServinError::VmUnavailable(format!(
                    "container {} was created in VM mode but VM mode is disabled",
                    record.id
                ))),
            }
        } else {
            Ok(Arc::new(self.inner.native.clone()))
        }
    }

    // ------------------------------------------------------------------
    // Container operations
    // ------------------------------------------------------------------

    pub async fn create_container(
        &self,
        options: ContainerOptions,
    ) -> ServinResult<ContainerRecord> {
        match self.default_backend().create(options.clone()).await {
            Err(ServinError::VmUnavailable(msg)) => {
                if cfg!(target_os = "linux") {
                    tracing::warn!(error = %msg, "VM unavailable, falling back to native isolation");
                    self.inner.native.create(options).await
                } else {
                    // No guest and no native namespaces: best-effort
                    // simulation. The record advertises networkMode=none and
                    // every requested isolation feature as unsupported.
                    tracing::warn!(error = %msg, "VM unavailable, falling back to best-effort simulation");
                    self.inner.native.create(simulation_options(options)).await
                }
            }
            other => other,
        }
    }

    pub async fn start_container(&self, id_or_name: &str) -> ServinResult<ContainerRecord> {
        let record = self.inner.manager.resolve(id_or_name)?;
        self.backend_for(&record)?.start(id_or_name).await
    }

    pub async fn stop_container(
        &self,
        id_or_name: &str,
        timeout: Option<Duration>,
    ) -> ServinResult<ContainerRecord> {
        let record = self.inner.manager.resolve(id_or_name)?;
        self.backend_for(&record)?.stop(id_or_name, timeout).await
    }

    pub async fn remove_container(&self, id_or_name: &str, force: bool) -> ServinResult<()> {
        let record = self.inner.manager.resolve(id_or_name)?;
        self.backend_for(&record)?.remove(id_or_name, force).await
    }

    pub async fn exec_in_container(
        &self,
        id_or_name: &str,
        argv: &[String],
        tty: bool,
    ) -> ServinResult<ExecResult> {
        let record = self.inner.manager.resolve(id_or_name)?;
        self.backend_for(&record)?.exec(id_or_name, argv, tty).await
    }

    pub async fn container_logs(
        &self,
        id_or_name: &str,
        query: &LogQuery,
    ) -> ServinResult<Vec<String>> {
        let record = self.inner.manager.resolve(id_or_name)?;
        self.backend_for(&record)?.logs(id_or_name, query).await
    }

    /// Follow-mode logs (native backend only; VM-mode logs are snapshot
    /// reads through the guest).
    pub async fn follow_container_logs(
        &self,
        id_or_name: &str,
        query: LogQuery,
        tx: tokio::sync::mpsc::Sender<String>,
    ) -> ServinResult<()> {
        self.inner.native.follow_logs(id_or_name, query, tx).await
    }

    pub async fn container_stats(&self, id_or_name: &str) -> ServinResult<CgroupStats> {
        let record = self.inner.manager.resolve(id_or_name)?;
        self.backend_for(&record)?.stats(id_or_name).await
    }

    pub async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> ServinResult<Vec<ContainerRecord>> {
        Ok(self.inner.manager.list(filter))
    }

    pub fn inspect_container(&self, id_or_name: &str) -> ServinResult<ContainerRecord> {
        self.inner.manager.resolve(id_or_name)
    }

    /// Remove an image, refusing while a live container references it.
    pub fn remove_image(&self, reference: &str, force: bool) -> ServinResult<()> {
        let in_use = self.inner.manager.image_in_use(reference);
        self.inner.images.remove(reference, force, in_use)
    }

    // ------------------------------------------------------------------
    // Servers
    // ------------------------------------------------------------------

    /// Build the CRI server over this runtime.
    pub fn cri_server(&self) -> Arc<CriServer> {
        Arc::new(CriServer::new(
            self.default_backend(),
            Arc::clone(&self.inner.images),
            Arc::clone(&self.inner.sandboxes),
            self.inner.layout.clone(),
            self.inner.cri_port,
        ))
    }

    /// Build the local registry server over this runtime's image store.
    pub fn registry_server(&self) -> ServinResult<Arc<RegistryServer>> {
        let config = RegistryConfig::load(&self.inner.layout)?;
        Ok(Arc::new(RegistryServer::new(
            Arc::clone(&self.inner.images),
            config,
        )?))
    }
}

/// Label recording the isolation features a simulated container asked for
/// but did not get.
const LABEL_UNSUPPORTED_ISOLATION: &str = "servin.isolation/unsupported";

/// Strip the options down to what a host without namespaces can honour,
/// recording every dropped feature on the record's labels.
fn simulation_options(mut options: ContainerOptions) -> ContainerOptions {
    let mut unsupported = vec!["namespaces".to_string(), "cgroups".to_string()];
    if options.network_mode != NetworkMode::None {
        unsupported.push(format!("network-{}", options.network_mode.as_str()));
    }
    if options.memory_limit > 0 {
        unsupported.push("memory-limit".to_string());
        options.memory_limit = 0;
    }
    if options.cpu_quota > 0.0 {
        unsupported.push("cpu-quota".to_string());
        options.cpu_quota = 0.0;
    }
    if !options.port_mappings.is_empty() {
        unsupported.push("port-mappings".to_string());
        options.port_mappings.clear();
    }
    options
        .labels
        .insert(LABEL_UNSUPPORTED_ISOLATION.to_string(), unsupported.join(","));
    options.network_mode = NetworkMode::None;
    options
}

impl std::fmt::Debug for ServinRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServinRuntime")
            .field("base_dir", &self.inner.layout.base_dir())
            .field("vm_mode", &self.inner.vm.is_some())
            .finish()
    }
}

// Compile-time assertion: the runtime must be shareable across threads.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<ServinRuntime>;
};
