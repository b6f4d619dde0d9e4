//! Trait seams for the external collaborator services named out-of-scope in
//! spec §1 (Image, Network, Volume, Device, System). The Orchestrator only
//! ever depends on these traits — production embedders supply the real OCI
//! registry client, netlink/bridge manager, VFIO binder, etc.

use async_trait::async_trait;

use crate::error::VmResult;

/// Status of a resolved image reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageStatus {
    Ready,
    Pending,
    Failed,
}

/// What the Config Disk Builder needs out of a resolved image: its default
/// entrypoint/cmd/workdir/env, to be merged with instance-level overrides.
#[derive(Clone, Debug)]
pub struct ImageInfo {
    pub status: ImageStatus,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub workdir: String,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve(&self, image_ref: &str) -> VmResult<ImageInfo>;
}

/// A live network allocation: a TAP device plus its assigned addressing.
#[derive(Clone, Debug)]
pub struct NetworkAllocation {
    pub tap_device: String,
    pub ip: String,
    pub mac: String,
    pub netmask: String,
    pub gateway: String,
    pub dns: String,
}

#[async_trait]
pub trait NetworkAllocator: Send + Sync {
    /// Allocate a fresh TAP device with newly assigned IP/MAC.
    async fn allocate(&self, instance_id: &str) -> VmResult<NetworkAllocation>;

    /// Allocate a fresh TAP device but preserve a previously issued IP/MAC
    /// (Restore §4.7 step 2, Start's "same IP/MAC if policy permits").
    async fn allocate_preserving(
        &self,
        instance_id: &str,
        ip: &str,
        mac: &str,
    ) -> VmResult<NetworkAllocation>;

    /// Release a TAP device. The device itself does not auto-delete
    /// (Standby §4.7 step 7) — this call is what actually tears it down.
    async fn release(&self, allocation: &NetworkAllocation) -> VmResult<()>;
}

#[derive(Clone, Debug)]
pub struct VolumeHandle {
    pub path: std::path::PathBuf,
}

#[async_trait]
pub trait VolumeService: Send + Sync {
    async fn attach(
        &self,
        volume_id: &str,
        instance_id: &str,
        readonly: bool,
    ) -> VmResult<VolumeHandle>;

    async fn detach(&self, volume_id: &str, instance_id: &str) -> VmResult<()>;
}

#[derive(Clone, Debug)]
pub struct DeviceHandle {
    pub sysfs_path: String,
}

#[async_trait]
pub trait DeviceService: Send + Sync {
    async fn bind_vfio(&self, device_ref: &str) -> VmResult<DeviceHandle>;
    async fn unbind(&self, handle: &DeviceHandle) -> VmResult<()>;
}

#[derive(Clone, Debug)]
pub struct KernelPaths {
    pub kernel_path: std::path::PathBuf,
    pub initrd_path: std::path::PathBuf,
}

#[async_trait]
pub trait SystemService: Send + Sync {
    async fn resolve_kernel(
        &self,
        hypervisor_kind: crate::model::HypervisorKind,
        version: &str,
    ) -> VmResult<KernelPaths>;
}
