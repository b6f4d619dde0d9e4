//! Orchestrator (spec §4.7): the multi-hop Create/Standby/Restore/Delete/
//! Start/Stop flows, each wrapped in a [`metrics::FlowTimer`] and backed by
//! a per-instance lock plus a LIFO [`CleanupStack`].
//!
//! State is never stored — every flow re-derives it per §4.6 before acting,
//! so a crashed or restarted embedder always finds the filesystem and
//! backend process to be ground truth rather than trusting stale metadata.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use tokio_util::sync::CancellationToken;

use crate::backend::{create_vsock_dialer, Backend, BackendRegistration, CleanupAction, Handle};
use crate::collaborators::{
    DeviceHandle, DeviceService, ImageResolver, ImageStatus, KernelPaths, NetworkAllocation,
    NetworkAllocator, SystemService, VolumeHandle, VolumeService,
};
use crate::config::RuntimeConfig;
use crate::configdisk;
use crate::error::{VmError, VmResult};
use crate::metrics::{Flow, FlowTimer, RuntimeMetrics, RuntimeMetricsStorage};
use crate::model::{
    DiskConfig, HypervisorKind, Instance, InstanceState, InstanceView, NetworkConfig, VmConfig,
    VolumeAttachment,
};
use crate::storage::Storage;
use crate::util::{derive_vsock_cid, kill_process, wait_for_exit};
use crate::vsock::{AsyncReadWrite, VsockDialer, VsockTarget};

/// Input to [`Orchestrator::create`]. Fields left `None` fall back to
/// `RuntimeConfig`'s defaults (Create flow step 4).
#[derive(Clone, Debug)]
pub struct CreateRequest {
    pub name: String,
    pub image: String,
    pub size_bytes: Option<u64>,
    pub hotplug_bytes: Option<u64>,
    pub overlay_size_bytes: Option<u64>,
    pub vcpus: Option<u32>,
    pub env: BTreeMap<String, String>,
    pub network_enabled: bool,
    pub volumes: Vec<VolumeAttachment>,
    pub devices: Vec<String>,
    pub hypervisor_kind: Option<HypervisorKind>,
    pub hypervisor_version: String,
    pub kernel_version: String,
}

/// A LIFO of undo thunks. Each flow pushes one per external allocation it
/// makes; on an early return every pushed thunk runs in reverse order,
/// logging (and swallowing) its own failure per §7's propagation policy. On
/// the success path the stack is [`disarm`](Self::disarm)ed without firing.
struct CleanupStack {
    actions: Vec<CleanupAction>,
}

impl CleanupStack {
    fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    fn push(&mut self, action: CleanupAction) {
        self.actions.push(action);
    }

    async fn unwind(&mut self) {
        while let Some(action) = self.actions.pop() {
            action().await;
        }
    }

    fn disarm(&mut self) {
        self.actions.clear();
    }
}

/// `^[a-z0-9]([a-z0-9-]*[a-z0-9])?$`, ≤63 chars, hand-rolled rather than
/// pulling in a regex engine for one fixed pattern.
fn validate_name(name: &str) -> VmResult<()> {
    let bytes = name.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let ok = !bytes.is_empty()
        && bytes.len() <= 63
        && is_alnum(bytes[0])
        && is_alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| is_alnum(b) || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(VmError::Validation(format!(
            "name '{name}' must match ^[a-z0-9]([a-z0-9-]*[a-z0-9])?$ and be at most 63 characters"
        )))
    }
}

/// Paths a volume must not be mounted at. Not exhaustive of every real
/// system directory — a judgment call in the absence of a literal list in
/// the spec; see DESIGN.md.
const SYSTEM_DIRECTORIES: &[&str] = &[
    "/", "/bin", "/sbin", "/usr", "/etc", "/proc", "/sys", "/dev", "/lib", "/lib64", "/boot",
    "/root", "/run",
];

fn validate_mount_path(path: &str, seen: &mut HashSet<String>) -> VmResult<()> {
    if !path.starts_with('/') {
        return Err(VmError::Validation(format!(
            "volume mount_path '{path}' must be absolute"
        )));
    }
    if SYSTEM_DIRECTORIES.contains(&path) {
        return Err(VmError::Validation(format!(
            "volume mount_path '{path}' is a reserved system directory"
        )));
    }
    if !seen.insert(path.to_string()) {
        return Err(VmError::Validation(format!(
            "volume mount_path '{path}' is attached more than once on this instance"
        )));
    }
    Ok(())
}

fn validate_create_request(req: &CreateRequest) -> VmResult<()> {
    validate_name(&req.name)?;
    if req.image.trim().is_empty() {
        return Err(VmError::Validation(
            "image reference must not be empty".to_string(),
        ));
    }
    if let Some(0) = req.vcpus {
        return Err(VmError::Validation("vcpus must be at least 1".to_string()));
    }

    let mut seen_paths = HashSet::new();
    for volume in &req.volumes {
        if volume.volume_id.trim().is_empty() {
            return Err(VmError::Validation(
                "volume_id must not be empty".to_string(),
            ));
        }
        validate_mount_path(&volume.mount_path, &mut seen_paths)?;
        if volume.overlay && !volume.readonly {
            return Err(VmError::Validation(format!(
                "volume '{}' has overlay=true but readonly=false (I6 requires readonly=true for overlay)",
                volume.volume_id
            )));
        }
        if volume.overlay && volume.overlay_size_bytes.unwrap_or(0) == 0 {
            return Err(VmError::Validation(format!(
                "volume '{}' has overlay=true but no overlay_size_bytes",
                volume.volume_id
            )));
        }
    }
    Ok(())
}

/// The Manager: holds the collaborator seams, the backend registry, and all
/// process-global bookkeeping the spec calls out in §5 (per-instance locks,
/// the vsock dialer cache, and the in-memory network-allocation cache used
/// by flows that must release an allocation after the backend that could
/// have reported it is already gone).
pub struct Orchestrator {
    storage: Storage,
    config: RuntimeConfig,
    backends: HashMap<HypervisorKind, Arc<dyn Backend>>,
    image_resolver: Arc<dyn ImageResolver>,
    network_allocator: Arc<dyn NetworkAllocator>,
    volume_service: Arc<dyn VolumeService>,
    device_service: Arc<dyn DeviceService>,
    system_service: Arc<dyn SystemService>,
    metrics: RuntimeMetricsStorage,
    locks: SyncRwLock<HashMap<String, Arc<tokio::sync::RwLock<()>>>>,
    /// §5's "vsock connection pool": since neither `VsockDialer` impl keeps
    /// a live connection open between calls, what is actually pooled here
    /// is the dialer instance itself, keyed by instance id. Evicted on
    /// Delete (and on any flow that tears the backend down).
    vsock_dialers: SyncMutex<HashMap<String, Arc<dyn VsockDialer>>>,
    /// Flows that release a network allocation (Standby, Stop, Delete) need
    /// it after the backend process — the only thing that would otherwise
    /// know it — is already gone. `NetworkAllocator` has no "look up by
    /// instance id" method, so the Orchestrator caches the `Allocation`
    /// returned by the most recent `allocate`/`allocate_preserving` call.
    network_allocations: SyncMutex<HashMap<String, NetworkAllocation>>,
}

impl Orchestrator {
    pub fn new(
        config: RuntimeConfig,
        image_resolver: Arc<dyn ImageResolver>,
        network_allocator: Arc<dyn NetworkAllocator>,
        volume_service: Arc<dyn VolumeService>,
        device_service: Arc<dyn DeviceService>,
        system_service: Arc<dyn SystemService>,
    ) -> Self {
        let storage = Storage::new(crate::path::PathResolver::new(config.data_root.clone()));

        let mut backends: HashMap<HypervisorKind, Arc<dyn Backend>> = HashMap::new();
        for registration in inventory::iter::<BackendRegistration> {
            backends.insert(registration.kind, (registration.backend_ctor)());
        }

        Self {
            storage,
            config,
            backends,
            image_resolver,
            network_allocator,
            volume_service,
            device_service,
            system_service,
            metrics: RuntimeMetricsStorage::new(),
            locks: SyncRwLock::new(HashMap::new()),
            vsock_dialers: SyncMutex::new(HashMap::new()),
            network_allocations: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        self.metrics.handle()
    }

    fn lock_for(&self, instance_id: &str) -> Arc<tokio::sync::RwLock<()>> {
        if let Some(lock) = self.locks.read().get(instance_id) {
            return lock.clone();
        }
        self.locks
            .write()
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::RwLock::new(())))
            .clone()
    }

    fn evict_lock(&self, instance_id: &str) {
        self.locks.write().remove(instance_id);
    }

    fn cache_network_allocation(&self, instance_id: &str, allocation: NetworkAllocation) {
        self.network_allocations
            .lock()
            .insert(instance_id.to_string(), allocation);
    }

    fn cached_network_allocation(&self, instance_id: &str) -> Option<NetworkAllocation> {
        self.network_allocations.lock().get(instance_id).cloned()
    }

    fn evict_network_allocation(&self, instance_id: &str) -> Option<NetworkAllocation> {
        self.network_allocations.lock().remove(instance_id)
    }

    fn evict_vsock_dialer(&self, instance_id: &str) {
        self.vsock_dialers.lock().remove(instance_id);
    }

    fn vsock_target_for(instance: &Instance) -> VsockTarget {
        match instance.hypervisor_type {
            HypervisorKind::SocketApi => VsockTarget::UnixMultiplexer(instance.vsock_socket.clone()),
            HypervisorKind::CmdlineMonitor => VsockTarget::AfVsock(instance.vsock_cid),
        }
    }

    fn vsock_dialer_for(&self, instance: &Instance) -> VmResult<Arc<dyn VsockDialer>> {
        if let Some(dialer) = self.vsock_dialers.lock().get(&instance.id) {
            return Ok(dialer.clone());
        }
        let dialer = create_vsock_dialer(instance.hypervisor_type, Self::vsock_target_for(instance))?;
        self.vsock_dialers
            .lock()
            .insert(instance.id.clone(), dialer.clone());
        Ok(dialer)
    }

    /// Dial `port` on the guest's vsock, reusing the cached dialer for this
    /// instance if one exists (§5).
    pub async fn dial_vsock(
        &self,
        ctx: &CancellationToken,
        instance_id: &str,
        port: u32,
    ) -> VmResult<Box<dyn AsyncReadWrite>> {
        let instance = self.storage.load(instance_id)?;
        let dialer = self.vsock_dialer_for(&instance)?;
        dialer.connect(ctx, port).await
    }

    fn backend_for(&self, instance: &Instance) -> VmResult<Arc<dyn Backend>> {
        self.backends
            .get(&instance.hypervisor_type)
            .cloned()
            .ok_or_else(|| {
                VmError::Capability(format!(
                    "no backend registered for {:?}",
                    instance.hypervisor_type
                ))
            })
    }

    /// §4.6's state-derivation algorithm. Never itself returns an error:
    /// an unattachable or unresponsive backend resolves to `Unknown` with a
    /// human-readable reason, per §7 ("`Unknown` is never itself an error
    /// return").
    async fn derive_state(&self, instance: &Instance) -> (InstanceState, Option<String>) {
        if !instance.socket_path.exists() {
            return if self.storage.has_snapshot(&instance.id) {
                (InstanceState::Standby, None)
            } else {
                (InstanceState::Stopped, None)
            };
        }

        let backend = match self.backends.get(&instance.hypervisor_type) {
            Some(backend) => backend.clone(),
            None => {
                return (
                    InstanceState::Unknown,
                    Some(format!(
                        "no backend registered for {:?}",
                        instance.hypervisor_type
                    )),
                )
            }
        };

        let ctx = CancellationToken::new();
        let handle = match backend.attach(&ctx, &instance.socket_path).await {
            Ok(handle) => handle,
            Err(e) => return (InstanceState::Unknown, Some(e.to_string())),
        };

        match handle.get_vm_info(&ctx).await {
            Ok(info) => (info.state, None),
            Err(e) => (InstanceState::Unknown, Some(e.to_string())),
        }
    }

    async fn to_view(&self, instance: Instance) -> InstanceView {
        let (state, state_error) = self.derive_state(&instance).await;
        let has_snapshot = self.storage.has_snapshot(&instance.id);
        InstanceView {
            instance,
            state,
            state_error,
            has_snapshot,
        }
    }

    async fn aggregate_usage(&self) -> VmResult<(u64, u32)> {
        let mut memory_bytes = 0u64;
        let mut vcpus = 0u32;
        for id in self.storage.list_ids()? {
            let Ok(instance) = self.storage.load(&id) else {
                continue;
            };
            let (state, _) = self.derive_state(&instance).await;
            if matches!(
                state,
                InstanceState::Created | InstanceState::Running | InstanceState::Paused
            ) {
                memory_bytes += instance.size_bytes + instance.hotplug_bytes;
                vcpus += instance.vcpus;
            }
        }
        Ok((memory_bytes, vcpus))
    }

    async fn enforce_resource_limits(
        &self,
        vcpus: u32,
        memory_bytes: u64,
        overlay_bytes: u64,
    ) -> VmResult<()> {
        if vcpus > self.config.max_vcpus_per_instance {
            return Err(VmError::ResourceLimitExceeded(format!(
                "requested {vcpus} vcpus exceeds per-instance cap of {}",
                self.config.max_vcpus_per_instance
            )));
        }
        if memory_bytes > self.config.max_memory_bytes_per_instance {
            return Err(VmError::ResourceLimitExceeded(format!(
                "requested {memory_bytes} bytes of memory exceeds per-instance cap of {}",
                self.config.max_memory_bytes_per_instance
            )));
        }
        if overlay_bytes > self.config.max_overlay_bytes_per_instance {
            return Err(VmError::ResourceLimitExceeded(format!(
                "requested {overlay_bytes} overlay bytes exceeds per-instance cap of {}",
                self.config.max_overlay_bytes_per_instance
            )));
        }

        let (aggregate_memory, aggregate_vcpus) = self.aggregate_usage().await?;
        if aggregate_memory + memory_bytes > self.config.max_aggregate_memory_bytes {
            return Err(VmError::ResourceLimitExceeded(format!(
                "aggregate memory {} would exceed cap of {}",
                aggregate_memory + memory_bytes,
                self.config.max_aggregate_memory_bytes
            )));
        }
        if aggregate_vcpus + vcpus > self.config.max_aggregate_vcpus {
            return Err(VmError::ResourceLimitExceeded(format!(
                "aggregate vcpus {} would exceed cap of {}",
                aggregate_vcpus + vcpus,
                self.config.max_aggregate_vcpus
            )));
        }
        Ok(())
    }

    async fn device_attached_elsewhere(&self, device_ref: &str) -> VmResult<bool> {
        for id in self.storage.list_ids()? {
            if let Ok(instance) = self.storage.load(&id) {
                if instance.devices.iter().any(|d| d == device_ref) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// (I5): a writer conflicts with any existing attachment; a reader
    /// conflicts only with an existing writer.
    async fn volume_conflict(&self, volume_id: &str, readonly: bool) -> VmResult<bool> {
        for id in self.storage.list_ids()? {
            if let Ok(instance) = self.storage.load(&id) {
                for attachment in &instance.volumes {
                    if attachment.volume_id == volume_id && (!readonly || !attachment.readonly) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn attach_volumes(&self, instance: &Instance) -> VmResult<Vec<VolumeHandle>> {
        let mut handles = Vec::with_capacity(instance.volumes.len());
        for attachment in &instance.volumes {
            handles.push(
                self.volume_service
                    .attach(&attachment.volume_id, &instance.id, attachment.readonly)
                    .await?,
            );
        }
        Ok(handles)
    }

    async fn bind_devices(&self, instance: &Instance) -> VmResult<Vec<DeviceHandle>> {
        let mut handles = Vec::with_capacity(instance.devices.len());
        for device_ref in &instance.devices {
            handles.push(self.device_service.bind_vfio(device_ref).await?);
        }
        Ok(handles)
    }

    /// disks[0]=overlay (vda), disks[1]=config disk (vdb), vdc reserved;
    /// volume disks follow starting at vdd, matching
    /// `configdisk::render_volume_mounts`.
    fn build_vm_config(
        &self,
        instance: &Instance,
        kernel: &KernelPaths,
        network_allocation: Option<&NetworkAllocation>,
        volume_handles: &[VolumeHandle],
        device_handles: &[DeviceHandle],
    ) -> VmConfig {
        let paths = self.storage.paths();
        let mut disks = vec![
            DiskConfig {
                path: paths.overlay_disk_path(&instance.id),
                readonly: false,
                io_bps: 0,
                burst_bps: 0,
            },
            DiskConfig {
                path: paths.config_disk_path(&instance.id),
                readonly: true,
                io_bps: 0,
                burst_bps: 0,
            },
        ];
        for (attachment, handle) in instance.volumes.iter().zip(volume_handles.iter()) {
            disks.push(DiskConfig {
                path: handle.path.clone(),
                readonly: attachment.overlay || attachment.readonly,
                io_bps: 0,
                burst_bps: 0,
            });
            if attachment.overlay {
                disks.push(DiskConfig {
                    path: paths.vol_overlay_disk_path(&instance.id, &attachment.volume_id),
                    readonly: false,
                    io_bps: 0,
                    burst_bps: 0,
                });
            }
        }

        VmConfig {
            vcpus: instance.vcpus,
            memory_bytes: instance.size_bytes,
            hotplug_bytes: instance.hotplug_bytes,
            cpu_topology: None,
            disks,
            networks: network_allocation
                .map(|allocation| {
                    vec![NetworkConfig {
                        tap_device: allocation.tap_device.clone(),
                        ip: allocation.ip.clone(),
                        mac: allocation.mac.clone(),
                        netmask: allocation.netmask.clone(),
                    }]
                })
                .unwrap_or_default(),
            serial_log_path: Some(paths.app_log_path(&instance.id)),
            vsock_cid: instance.vsock_cid,
            vsock_socket: paths.vsock_socket_path(&instance.id),
            pci_devices: device_handles
                .iter()
                .map(|handle| handle.sysfs_path.clone())
                .collect(),
            kernel_path: kernel.kernel_path.clone(),
            initrd_path: kernel.initrd_path.clone(),
            kernel_args: String::new(),
        }
    }

    // ---- Create ---------------------------------------------------------

    pub async fn create(&self, req: CreateRequest) -> VmResult<InstanceView> {
        let timer = FlowTimer::start(&self.metrics, Flow::Create);
        let result = self.create_inner(req).await;
        timer.finish(&result);
        result
    }

    async fn create_inner(&self, req: CreateRequest) -> VmResult<InstanceView> {
        validate_create_request(&req)?;

        let image = self.image_resolver.resolve(&req.image).await?;
        if image.status != ImageStatus::Ready {
            return Err(VmError::ImageNotReady(req.image.clone()));
        }

        let id = nanoid::nanoid!(21);
        let vsock_cid = derive_vsock_cid(&id);

        let size_bytes = req.size_bytes.unwrap_or(self.config.default_size_bytes);
        let hotplug_bytes = req
            .hotplug_bytes
            .unwrap_or(self.config.default_hotplug_bytes);
        let overlay_size_bytes = req
            .overlay_size_bytes
            .unwrap_or(self.config.default_overlay_size_bytes);
        let vcpus = req.vcpus.unwrap_or(self.config.default_vcpus);

        self.enforce_resource_limits(vcpus, size_bytes + hotplug_bytes, overlay_size_bytes)
            .await?;

        let hypervisor_kind = req.hypervisor_kind.unwrap_or(HypervisorKind::SocketApi);
        let backend = self.backends.get(&hypervisor_kind).cloned().ok_or_else(|| {
            VmError::Capability(format!("no backend registered for {hypervisor_kind:?}"))
        })?;
        let kernel = self
            .system_service
            .resolve_kernel(hypervisor_kind, &req.kernel_version)
            .await?;

        let paths = self.storage.paths().clone();
        let socket_path = paths.backend_socket_path(&id, hypervisor_kind);
        let data_dir = paths.data_dir(&id);
        let vsock_socket = paths.vsock_socket_path(&id);

        let mut cleanup = CleanupStack::new();

        for device_ref in &req.devices {
            if self.device_attached_elsewhere(device_ref).await? {
                cleanup.unwind().await;
                return Err(VmError::AlreadyExists(format!(
                    "device {device_ref} is already attached to another instance"
                )));
            }
        }

        let mut device_handles = Vec::with_capacity(req.devices.len());
        for device_ref in &req.devices {
            let handle = match self.device_service.bind_vfio(device_ref).await {
                Ok(handle) => handle,
                Err(e) => {
                    cleanup.unwind().await;
                    return Err(e);
                }
            };
            device_handles.push(handle.clone());
            let device_service = self.device_service.clone();
            let handle_for_cleanup = handle;
            cleanup.push(Box::new(move || {
                Box::pin(async move {
                    if let Err(e) = device_service.unbind(&handle_for_cleanup).await {
                        tracing::warn!(error = %e, "failed to unbind device during cleanup unwind");
                    }
                })
            }));
        }

        if let Err(e) = self.storage.ensure_directories(&id) {
            cleanup.unwind().await;
            return Err(e);
        }
        {
            let storage = self.storage.clone();
            let id_for_cleanup = id.clone();
            cleanup.push(Box::new(move || {
                Box::pin(async move {
                    if let Err(e) = storage.delete_instance_data(&id_for_cleanup) {
                        tracing::warn!(error = %e, "failed to remove data_dir during cleanup unwind");
                    }
                })
            }));
        }

        if let Err(e) = self.storage.create_overlay_disk(&id, overlay_size_bytes) {
            cleanup.unwind().await;
            return Err(e);
        }

        let network_allocation = if req.network_enabled {
            match self.network_allocator.allocate(&id).await {
                Ok(allocation) => {
                    let network_allocator = self.network_allocator.clone();
                    let allocation_for_cleanup = allocation.clone();
                    cleanup.push(Box::new(move || {
                        Box::pin(async move {
                            if let Err(e) = network_allocator.release(&allocation_for_cleanup).await {
                                tracing::warn!(error = %e, "failed to release network allocation during cleanup unwind");
                            }
                        })
                    }));
                    Some(allocation)
                }
                Err(e) => {
                    cleanup.unwind().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        for attachment in &req.volumes {
            if self
                .volume_conflict(&attachment.volume_id, attachment.readonly)
                .await?
            {
                cleanup.unwind().await;
                return Err(VmError::AlreadyExists(format!(
                    "volume {} is already attached incompatibly with this request",
                    attachment.volume_id
                )));
            }
        }

        let mut volume_handles = Vec::with_capacity(req.volumes.len());
        for attachment in &req.volumes {
            let handle = match self
                .volume_service
                .attach(&attachment.volume_id, &id, attachment.readonly)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    cleanup.unwind().await;
                    return Err(e);
                }
            };
            volume_handles.push(handle);
            {
                let volume_service = self.volume_service.clone();
                let volume_id = attachment.volume_id.clone();
                let instance_id = id.clone();
                cleanup.push(Box::new(move || {
                    Box::pin(async move {
                        if let Err(e) = volume_service.detach(&volume_id, &instance_id).await {
                            tracing::warn!(error = %e, "failed to detach volume during cleanup unwind");
                        }
                    })
                }));
            }
            if attachment.overlay {
                let overlay_size = attachment
                    .overlay_size_bytes
                    .unwrap_or(self.config.default_overlay_size_bytes);
                if let Err(e) =
                    self.storage
                        .create_volume_overlay_disk(&id, &attachment.volume_id, overlay_size)
                {
                    cleanup.unwind().await;
                    return Err(e);
                }
            }
        }

        let instance = Instance {
            id: id.clone(),
            name: req.name.clone(),
            image: req.image.clone(),
            size_bytes,
            hotplug_bytes,
            overlay_size_bytes,
            vcpus,
            env: req.env.clone(),
            network_enabled: req.network_enabled,
            ip: network_allocation.as_ref().map(|a| a.ip.clone()),
            mac: network_allocation.as_ref().map(|a| a.mac.clone()),
            volumes: req.volumes.clone(),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            kernel_version: req.kernel_version.clone(),
            hypervisor_type: hypervisor_kind,
            hypervisor_version: req.hypervisor_version.clone(),
            hypervisor_pid: None,
            socket_path: socket_path.clone(),
            data_dir,
            vsock_cid,
            vsock_socket,
            devices: req.devices.clone(),
        };

        if let Err(e) = configdisk::build(
            &instance,
            &image,
            network_allocation.as_ref(),
            &paths.config_disk_path(&id),
        ) {
            cleanup.unwind().await;
            return Err(e);
        }

        if let Err(e) = self.storage.save(&instance) {
            cleanup.unwind().await;
            return Err(e);
        }

        let vm_config = self.build_vm_config(
            &instance,
            &kernel,
            network_allocation.as_ref(),
            &volume_handles,
            &device_handles,
        );

        let ctx = CancellationToken::new();
        let (pid, handle) = match backend
            .start_vm(&ctx, &instance.hypervisor_version, &socket_path, &vm_config)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                cleanup.unwind().await;
                return Err(e);
            }
        };
        let handle: Arc<dyn Handle> = Arc::from(handle);
        {
            let handle = handle.clone();
            let socket_path = socket_path.clone();
            cleanup.push(Box::new(move || {
                Box::pin(async move {
                    let ctx = CancellationToken::new();
                    if let Err(e) = handle.shutdown(&ctx).await {
                        tracing::warn!(error = %e, "failed to shut down backend during cleanup unwind");
                    }
                    if kill_process(pid) {
                        tracing::debug!(pid, "killed backend process during cleanup unwind");
                    }
                    let _ = std::fs::remove_file(&socket_path);
                })
            }));
        }

        let capabilities = backend.capabilities();
        if hotplug_bytes > 0 && capabilities.hotplug_memory {
            if let Err(e) = handle
                .resize_memory_and_wait(
                    &ctx,
                    size_bytes + hotplug_bytes,
                    self.config.memory_stabilize_timeout,
                )
                .await
            {
                tracing::warn!(error = %e, instance_id = %id, "best-effort hotplug resize failed during create");
            }
        }

        let mut instance = instance;
        instance.started_at = Some(Utc::now());
        instance.hypervisor_pid = Some(pid);
        if let Err(e) = self.storage.save(&instance) {
            cleanup.unwind().await;
            return Err(e);
        }

        if let Some(allocation) = network_allocation {
            self.cache_network_allocation(&id, allocation);
        }

        cleanup.disarm();
        self.metrics.record_state_transition();
        Ok(self.to_view(instance).await)
    }

    // ---- Standby ----------------------------------------------------------

    pub async fn standby(&self, instance_id: &str) -> VmResult<InstanceView> {
        let timer = FlowTimer::start(&self.metrics, Flow::Standby);
        let result = self.standby_inner(instance_id).await;
        timer.finish(&result);
        result
    }

    async fn standby_inner(&self, instance_id: &str) -> VmResult<InstanceView> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.write().await;

        let mut instance = self.storage.load(instance_id)?;
        let (state, _) = self.derive_state(&instance).await;
        if state != InstanceState::Running {
            return Err(VmError::InvalidState(format!(
                "cannot standby instance {instance_id} from state {state:?}"
            )));
        }

        let backend = self.backend_for(&instance)?;
        let capabilities = backend.capabilities();
        if !capabilities.snapshot {
            return Err(VmError::Capability(format!(
                "backend {:?} does not support snapshot",
                instance.hypervisor_type
            )));
        }

        let ctx = CancellationToken::new();
        let handle = backend.attach(&ctx, &instance.socket_path).await?;

        let network_allocation = if instance.network_enabled {
            self.cached_network_allocation(instance_id)
        } else {
            None
        };

        if capabilities.hotplug_memory {
            if let Err(e) = handle
                .resize_memory_and_wait(&ctx, instance.size_bytes, self.config.memory_stabilize_timeout)
                .await
            {
                tracing::warn!(error = %e, instance_id, "best-effort memory reduction failed during standby");
            }
        }

        handle.pause(&ctx).await?;

        let snapshot_dir = self.storage.paths().snapshot_latest_dir(instance_id);
        let _ = std::fs::remove_dir_all(&snapshot_dir);
        if let Err(e) = std::fs::create_dir_all(&snapshot_dir) {
            return Err(VmError::Internal(format!(
                "failed to create snapshot dir {}: {e}",
                snapshot_dir.display()
            )));
        }

        if let Err(e) = handle.snapshot(&ctx, &snapshot_dir).await {
            if let Err(resume_err) = handle.resume(&ctx).await {
                tracing::warn!(error = %resume_err, instance_id, "failed to resume after snapshot failure");
            }
            return Err(e);
        }

        if let Err(e) = handle.shutdown(&ctx).await {
            tracing::warn!(error = %e, instance_id, "graceful shutdown request failed during standby");
        }
        if let Some(pid) = instance.hypervisor_pid {
            if let Err(e) = wait_for_exit(
                &ctx,
                pid,
                self.config.graceful_shutdown_timeout,
                self.config.process_exit_poll_interval,
            )
            .await
            {
                tracing::warn!(error = %e, instance_id, pid, "backend did not exit within graceful shutdown window");
            }
        }

        if let Some(allocation) = network_allocation {
            if let Err(e) = self.network_allocator.release(&allocation).await {
                tracing::warn!(error = %e, instance_id, "failed to release network allocation during standby");
            }
        }
        self.evict_network_allocation(instance_id);
        self.evict_vsock_dialer(instance_id);

        instance.hypervisor_pid = None;
        instance.stopped_at = Some(Utc::now());
        self.storage.save(&instance)?;

        self.metrics.record_state_transition();
        Ok(self.to_view(instance).await)
    }

    // ---- Restore ------------------------------------------------------

    pub async fn restore(&self, instance_id: &str) -> VmResult<InstanceView> {
        let timer = FlowTimer::start(&self.metrics, Flow::Restore);
        let result = self.restore_inner(instance_id).await;
        timer.finish(&result);
        result
    }

    async fn restore_inner(&self, instance_id: &str) -> VmResult<InstanceView> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.write().await;

        let mut instance = self.storage.load(instance_id)?;
        let (state, _) = self.derive_state(&instance).await;
        if state != InstanceState::Standby || !self.storage.has_snapshot(instance_id) {
            return Err(VmError::InvalidState(format!(
                "cannot restore instance {instance_id} from state {state:?}"
            )));
        }

        let backend = self.backend_for(&instance)?;
        let mut cleanup = CleanupStack::new();

        let network_allocation = if instance.network_enabled {
            let ip = instance.ip.clone().unwrap_or_default();
            let mac = instance.mac.clone().unwrap_or_default();
            match self
                .network_allocator
                .allocate_preserving(instance_id, &ip, &mac)
                .await
            {
                Ok(allocation) => {
                    let network_allocator = self.network_allocator.clone();
                    let allocation_for_cleanup = allocation.clone();
                    cleanup.push(Box::new(move || {
                        Box::pin(async move {
                            if let Err(e) = network_allocator.release(&allocation_for_cleanup).await {
                                tracing::warn!(error = %e, "failed to release network allocation during cleanup unwind");
                            }
                        })
                    }));
                    Some(allocation)
                }
                Err(e) => {
                    cleanup.unwind().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let ctx = CancellationToken::new();
        let snapshot_dir = self.storage.paths().snapshot_latest_dir(instance_id);
        let (pid, handle) = match backend
            .restore_vm(&ctx, &instance.hypervisor_version, &instance.socket_path, &snapshot_dir)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                cleanup.unwind().await;
                return Err(e);
            }
        };
        let handle: Arc<dyn Handle> = Arc::from(handle);
        {
            let handle = handle.clone();
            cleanup.push(Box::new(move || {
                Box::pin(async move {
                    let ctx = CancellationToken::new();
                    if let Err(e) = handle.shutdown(&ctx).await {
                        tracing::warn!(error = %e, "failed to shut down backend during restore cleanup");
                    }
                    if kill_process(pid) {
                        tracing::debug!(pid, "killed backend process during restore cleanup unwind");
                    }
                })
            }));
        }

        if let Err(e) = handle.resume(&ctx).await {
            cleanup.unwind().await;
            return Err(e);
        }

        if let Err(e) = std::fs::remove_dir_all(&snapshot_dir) {
            tracing::warn!(error = %e, instance_id, "failed to remove snapshot directory after restore");
        }

        instance.hypervisor_pid = Some(pid);
        instance.started_at = Some(Utc::now());
        if let Some(allocation) = &network_allocation {
            instance.ip = Some(allocation.ip.clone());
            instance.mac = Some(allocation.mac.clone());
        }
        if let Err(e) = self.storage.save(&instance) {
            cleanup.unwind().await;
            return Err(e);
        }

        if let Some(allocation) = network_allocation {
            self.cache_network_allocation(instance_id, allocation);
        }

        cleanup.disarm();
        self.metrics.record_state_transition();
        Ok(self.to_view(instance).await)
    }

    // ---- Delete ---------------------------------------------------------

    pub async fn delete(&self, instance_id: &str) -> VmResult<()> {
        let timer = FlowTimer::start(&self.metrics, Flow::Delete);
        let result = self.delete_inner(instance_id).await;
        timer.finish(&result);
        result
    }

    async fn delete_inner(&self, instance_id: &str) -> VmResult<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.write().await;

        let instance = self.storage.load(instance_id)?;
        let (state, _) = self.derive_state(&instance).await;

        let network_allocation = self.evict_network_allocation(instance_id);
        self.evict_vsock_dialer(instance_id);

        let ctx = CancellationToken::new();
        let needs_kill = matches!(
            state,
            InstanceState::Created
                | InstanceState::Running
                | InstanceState::Paused
                | InstanceState::Shutdown
                | InstanceState::Unknown
        );
        if needs_kill {
            if let Some(pid) = instance.hypervisor_pid {
                // Q3: kill unconditionally, no cmdline re-verification — the
                // data_dir is being discarded regardless of outcome.
                if kill_process(pid) {
                    if let Err(e) = wait_for_exit(
                        &ctx,
                        pid,
                        self.config.process_exit_timeout,
                        self.config.process_exit_poll_interval,
                    )
                    .await
                    {
                        tracing::warn!(error = %e, instance_id, pid, "backend did not reap within delete's wait window");
                    }
                } else {
                    tracing::warn!(instance_id, pid, "failed to signal backend process during delete");
                }
            }
            let _ = std::fs::remove_file(&instance.socket_path);
        }

        if let Some(allocation) = network_allocation {
            if let Err(e) = self.network_allocator.release(&allocation).await {
                tracing::warn!(error = %e, instance_id, "failed to release network allocation during delete");
            }
        } else if instance.network_enabled {
            tracing::warn!(instance_id, "network_enabled but no cached allocation to release during delete");
        }

        for device_ref in &instance.devices {
            match self.device_service.bind_vfio(device_ref).await {
                Ok(handle) => {
                    if let Err(e) = self.device_service.unbind(&handle).await {
                        tracing::warn!(error = %e, instance_id, device_ref, "failed to unbind device during delete");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, instance_id, device_ref, "failed to resolve device handle during delete");
                }
            }
        }

        for attachment in &instance.volumes {
            if let Err(e) = self
                .volume_service
                .detach(&attachment.volume_id, instance_id)
                .await
            {
                tracing::warn!(error = %e, instance_id, volume_id = %attachment.volume_id, "failed to detach volume during delete");
            }
        }

        self.storage.delete_instance_data(instance_id)?;
        self.evict_lock(instance_id);
        self.metrics.record_state_transition();
        Ok(())
    }

    // ---- Start / Stop -----------------------------------------------------

    pub async fn start(&self, instance_id: &str) -> VmResult<InstanceView> {
        let timer = FlowTimer::start(&self.metrics, Flow::Start);
        let result = self.start_inner(instance_id).await;
        timer.finish(&result);
        result
    }

    async fn start_inner(&self, instance_id: &str) -> VmResult<InstanceView> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.write().await;

        let mut instance = self.storage.load(instance_id)?;
        let (state, _) = self.derive_state(&instance).await;
        if state != InstanceState::Stopped {
            return Err(VmError::InvalidState(format!(
                "cannot start instance {instance_id} from state {state:?}"
            )));
        }

        let backend = self.backend_for(&instance)?;
        let image = self.image_resolver.resolve(&instance.image).await?;
        if image.status != ImageStatus::Ready {
            return Err(VmError::ImageNotReady(instance.image.clone()));
        }
        let kernel = self
            .system_service
            .resolve_kernel(instance.hypervisor_type, &instance.kernel_version)
            .await?;

        let mut cleanup = CleanupStack::new();

        let network_allocation = if instance.network_enabled {
            let ip = instance.ip.clone().unwrap_or_default();
            let mac = instance.mac.clone().unwrap_or_default();
            match self
                .network_allocator
                .allocate_preserving(instance_id, &ip, &mac)
                .await
            {
                Ok(allocation) => {
                    let network_allocator = self.network_allocator.clone();
                    let allocation_for_cleanup = allocation.clone();
                    cleanup.push(Box::new(move || {
                        Box::pin(async move {
                            if let Err(e) = network_allocator.release(&allocation_for_cleanup).await {
                                tracing::warn!(error = %e, "failed to release network allocation during cleanup unwind");
                            }
                        })
                    }));
                    Some(allocation)
                }
                Err(e) => {
                    cleanup.unwind().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let volume_handles = match self.attach_volumes(&instance).await {
            Ok(handles) => handles,
            Err(e) => {
                cleanup.unwind().await;
                return Err(e);
            }
        };
        let device_handles = match self.bind_devices(&instance).await {
            Ok(handles) => handles,
            Err(e) => {
                cleanup.unwind().await;
                return Err(e);
            }
        };

        if let Err(e) = configdisk::build(
            &instance,
            &image,
            network_allocation.as_ref(),
            &self.storage.paths().config_disk_path(instance_id),
        ) {
            cleanup.unwind().await;
            return Err(e);
        }

        let vm_config = self.build_vm_config(
            &instance,
            &kernel,
            network_allocation.as_ref(),
            &volume_handles,
            &device_handles,
        );

        let ctx = CancellationToken::new();
        let (pid, handle) = match backend
            .start_vm(&ctx, &instance.hypervisor_version, &instance.socket_path, &vm_config)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                cleanup.unwind().await;
                return Err(e);
            }
        };
        let handle: Arc<dyn Handle> = Arc::from(handle);
        {
            let handle = handle.clone();
            let socket_path = instance.socket_path.clone();
            cleanup.push(Box::new(move || {
                Box::pin(async move {
                    let ctx = CancellationToken::new();
                    if let Err(e) = handle.shutdown(&ctx).await {
                        tracing::warn!(error = %e, "failed to shut down backend during cleanup unwind");
                    }
                    if kill_process(pid) {
                        tracing::debug!(pid, "killed backend process during cleanup unwind");
                    }
                    let _ = std::fs::remove_file(&socket_path);
                })
            }));
        }
        drop(handle);

        instance.hypervisor_pid = Some(pid);
        instance.started_at = Some(Utc::now());
        if let Err(e) = self.storage.save(&instance) {
            cleanup.unwind().await;
            return Err(e);
        }

        if let Some(allocation) = network_allocation {
            self.cache_network_allocation(instance_id, allocation);
        }

        cleanup.disarm();
        self.metrics.record_state_transition();
        Ok(self.to_view(instance).await)
    }

    pub async fn stop(&self, instance_id: &str) -> VmResult<InstanceView> {
        let timer = FlowTimer::start(&self.metrics, Flow::Stop);
        let result = self.stop_inner(instance_id).await;
        timer.finish(&result);
        result
    }

    async fn stop_inner(&self, instance_id: &str) -> VmResult<InstanceView> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.write().await;

        let mut instance = self.storage.load(instance_id)?;
        let (state, _) = self.derive_state(&instance).await;
        if state != InstanceState::Running {
            return Err(VmError::InvalidState(format!(
                "cannot stop instance {instance_id} from state {state:?}"
            )));
        }

        let backend = self.backend_for(&instance)?;
        let ctx = CancellationToken::new();
        let handle = backend.attach(&ctx, &instance.socket_path).await?;
        handle.shutdown(&ctx).await?;

        if let Some(pid) = instance.hypervisor_pid {
            if let Err(e) = wait_for_exit(
                &ctx,
                pid,
                self.config.process_exit_timeout,
                self.config.process_exit_poll_interval,
            )
            .await
            {
                tracing::warn!(error = %e, instance_id, pid, "backend did not exit promptly after stop");
            }
        }

        if let Some(allocation) = self.evict_network_allocation(instance_id) {
            if let Err(e) = self.network_allocator.release(&allocation).await {
                tracing::warn!(error = %e, instance_id, "failed to release network allocation during stop");
            }
        }
        self.evict_vsock_dialer(instance_id);

        instance.hypervisor_pid = None;
        instance.stopped_at = Some(Utc::now());
        self.storage.save(&instance)?;

        self.metrics.record_state_transition();
        Ok(self.to_view(instance).await)
    }

    // ---- Get / List -----------------------------------------------------

    pub async fn get(&self, instance_id: &str) -> VmResult<InstanceView> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.read().await;
        let instance = self.storage.load(instance_id)?;
        Ok(self.to_view(instance).await)
    }

    /// Lock-free per §4.7/I8: may observe a stale snapshot under concurrent
    /// mutation, which is an accepted tradeoff for ListInstances.
    pub async fn list(&self) -> VmResult<Vec<InstanceView>> {
        let mut views = Vec::new();
        for id in self.storage.list_ids()? {
            if let Ok(instance) = self.storage.load(&id) {
                views.push(self.to_view(instance).await);
            }
        }
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ImageInfo;
    use std::path::{Path, PathBuf};

    struct FakeImageResolver;
    #[async_trait::async_trait]
    impl ImageResolver for FakeImageResolver {
        async fn resolve(&self, _image_ref: &str) -> VmResult<ImageInfo> {
            Ok(ImageInfo {
                status: ImageStatus::Ready,
                entrypoint: vec!["/bin/sh".to_string()],
                cmd: vec![],
                workdir: "/".to_string(),
                env: vec![],
            })
        }
    }

    struct FakeNetworkAllocator;
    #[async_trait::async_trait]
    impl NetworkAllocator for FakeNetworkAllocator {
        async fn allocate(&self, instance_id: &str) -> VmResult<NetworkAllocation> {
            Ok(NetworkAllocation {
                tap_device: format!("tap-{instance_id}"),
                ip: "10.0.0.2".to_string(),
                mac: "02:00:00:00:00:01".to_string(),
                netmask: "255.255.255.0".to_string(),
                gateway: "10.0.0.1".to_string(),
                dns: "8.8.8.8".to_string(),
            })
        }

        async fn allocate_preserving(
            &self,
            instance_id: &str,
            ip: &str,
            mac: &str,
        ) -> VmResult<NetworkAllocation> {
            Ok(NetworkAllocation {
                tap_device: format!("tap-{instance_id}"),
                ip: ip.to_string(),
                mac: mac.to_string(),
                netmask: "255.255.255.0".to_string(),
                gateway: "10.0.0.1".to_string(),
                dns: "8.8.8.8".to_string(),
            })
        }

        async fn release(&self, _allocation: &NetworkAllocation) -> VmResult<()> {
            Ok(())
        }
    }

    struct FakeVolumeService;
    #[async_trait::async_trait]
    impl VolumeService for FakeVolumeService {
        async fn attach(
            &self,
            volume_id: &str,
            _instance_id: &str,
            _readonly: bool,
        ) -> VmResult<VolumeHandle> {
            Ok(VolumeHandle {
                path: PathBuf::from(format!("/dev/fake-{volume_id}")),
            })
        }

        async fn detach(&self, _volume_id: &str, _instance_id: &str) -> VmResult<()> {
            Ok(())
        }
    }

    struct FakeDeviceService;
    #[async_trait::async_trait]
    impl DeviceService for FakeDeviceService {
        async fn bind_vfio(&self, device_ref: &str) -> VmResult<DeviceHandle> {
            Ok(DeviceHandle {
                sysfs_path: format!("/sys/bus/pci/devices/{device_ref}"),
            })
        }

        async fn unbind(&self, _handle: &DeviceHandle) -> VmResult<()> {
            Ok(())
        }
    }

    struct FakeSystemService;
    #[async_trait::async_trait]
    impl SystemService for FakeSystemService {
        async fn resolve_kernel(
            &self,
            _hypervisor_kind: HypervisorKind,
            _version: &str,
        ) -> VmResult<KernelPaths> {
            Ok(KernelPaths {
                kernel_path: PathBuf::from("/boot/vmlinux"),
                initrd_path: PathBuf::from("/boot/initrd"),
            })
        }
    }

    fn test_orchestrator(data_root: &Path) -> Orchestrator {
        let mut config = RuntimeConfig::default();
        config.data_root = data_root.to_path_buf();
        Orchestrator::new(
            config,
            Arc::new(FakeImageResolver),
            Arc::new(FakeNetworkAllocator),
            Arc::new(FakeVolumeService),
            Arc::new(FakeDeviceService),
            Arc::new(FakeSystemService),
        )
    }

    fn base_request(name: &str) -> CreateRequest {
        CreateRequest {
            name: name.to_string(),
            image: "alpine:latest".to_string(),
            size_bytes: Some(64 * 1024 * 1024),
            hotplug_bytes: Some(0),
            overlay_size_bytes: Some(16 * 1024 * 1024),
            vcpus: Some(1),
            env: BTreeMap::new(),
            network_enabled: false,
            volumes: Vec::new(),
            devices: Vec::new(),
            hypervisor_kind: Some(HypervisorKind::SocketApi),
            hypervisor_version: "1.0".to_string(),
            kernel_version: "6.1".to_string(),
        }
    }

    fn stopped_instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            name: "demo".to_string(),
            image: "alpine:latest".to_string(),
            size_bytes: 64 * 1024 * 1024,
            hotplug_bytes: 0,
            overlay_size_bytes: 16 * 1024 * 1024,
            vcpus: 1,
            env: BTreeMap::new(),
            network_enabled: false,
            ip: None,
            mac: None,
            volumes: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            kernel_version: "6.1".to_string(),
            hypervisor_type: HypervisorKind::SocketApi,
            hypervisor_version: "1.0".to_string(),
            hypervisor_pid: None,
            socket_path: PathBuf::from("/tmp/microvm-core-orchestrator-test-nonexistent.sock"),
            data_dir: PathBuf::from("/tmp/microvm-core-orchestrator-test"),
            vsock_cid: derive_vsock_cid(id),
            vsock_socket: PathBuf::from("/tmp/microvm-core-orchestrator-test/vsock.sock"),
            devices: Vec::new(),
        }
    }

    #[test]
    fn name_validation_accepts_and_rejects() {
        assert!(validate_name("demo-1").is_ok());
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("Demo").is_err());
        assert!(validate_name("-demo").is_err());
        assert!(validate_name("demo-").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[tokio::test]
    async fn get_missing_instance_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(tmp.path());
        let result = orchestrator.get("does-not-exist").await;
        assert!(matches!(result, Err(VmError::NotFound(_))));
    }

    #[tokio::test]
    async fn create_rejects_invalid_name() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(tmp.path());
        let req = base_request("Invalid_Name");
        let result = orchestrator.create(req).await;
        assert!(matches!(result, Err(VmError::Validation(_))));
    }

    #[tokio::test]
    async fn create_rejects_overlay_volume_without_readonly() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(tmp.path());
        let mut req = base_request("demo");
        req.volumes.push(VolumeAttachment {
            volume_id: "v1".to_string(),
            mount_path: "/data".to_string(),
            readonly: false,
            overlay: true,
            overlay_size_bytes: Some(1024 * 1024),
        });
        let result = orchestrator.create(req).await;
        assert!(matches!(result, Err(VmError::Validation(_))));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_mount_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(tmp.path());
        let mut req = base_request("demo");
        req.volumes.push(VolumeAttachment {
            volume_id: "v1".to_string(),
            mount_path: "/data".to_string(),
            readonly: true,
            overlay: false,
            overlay_size_bytes: None,
        });
        req.volumes.push(VolumeAttachment {
            volume_id: "v2".to_string(),
            mount_path: "/data".to_string(),
            readonly: true,
            overlay: false,
            overlay_size_bytes: None,
        });
        let result = orchestrator.create(req).await;
        assert!(matches!(result, Err(VmError::Validation(_))));
    }

    #[tokio::test]
    async fn resource_limits_reject_oversized_vcpu_request() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.data_root = tmp.path().to_path_buf();
        config.max_vcpus_per_instance = 2;
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(FakeImageResolver),
            Arc::new(FakeNetworkAllocator),
            Arc::new(FakeVolumeService),
            Arc::new(FakeDeviceService),
            Arc::new(FakeSystemService),
        );
        let mut req = base_request("demo");
        req.vcpus = Some(4);
        let result = orchestrator.create(req).await;
        assert!(matches!(result, Err(VmError::ResourceLimitExceeded(_))));
    }

    #[tokio::test]
    async fn standby_on_stopped_instance_is_invalid_state() {
        // S3: an instance with no live socket and no snapshot derives as
        // Stopped; Standby is only legal from Running.
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(tmp.path());
        let instance = stopped_instance("stopped-1");
        orchestrator.storage.ensure_directories(&instance.id).unwrap();
        orchestrator.storage.save(&instance).unwrap();

        let result = orchestrator.standby(&instance.id).await;
        assert!(matches!(result, Err(VmError::InvalidState(_))));
    }

    #[tokio::test]
    async fn restore_on_stopped_instance_is_invalid_state() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(tmp.path());
        let instance = stopped_instance("stopped-2");
        orchestrator.storage.ensure_directories(&instance.id).unwrap();
        orchestrator.storage.save(&instance).unwrap();

        let result = orchestrator.restore(&instance.id).await;
        assert!(matches!(result, Err(VmError::InvalidState(_))));
    }

    #[tokio::test]
    async fn delete_on_stopped_instance_removes_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(tmp.path());
        let instance = stopped_instance("stopped-3");
        orchestrator.storage.ensure_directories(&instance.id).unwrap();
        orchestrator.storage.save(&instance).unwrap();

        orchestrator.delete(&instance.id).await.unwrap();
        assert!(orchestrator.storage.load(&instance.id).is_err());
    }

    #[tokio::test]
    async fn list_reflects_saved_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(tmp.path());
        let instance = stopped_instance("listed-1");
        orchestrator.storage.ensure_directories(&instance.id).unwrap();
        orchestrator.storage.save(&instance).unwrap();

        let views = orchestrator.list().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].state, InstanceState::Stopped);
    }
}
