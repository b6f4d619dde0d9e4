//! Core data model: persisted [`Instance`] records and the derived,
//! non-persistent views/configs built on top of them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single attached volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub mount_path: String,
    pub readonly: bool,
    pub overlay: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_size_bytes: Option<u64>,
}

/// The persisted, on-disk record for one instance.
///
/// Field order here is serialization order: `serde_json::to_writer_pretty`
/// walks struct fields in declaration order, which is what gives us the
/// "stable key order" metadata.json requires without a custom `Serialize`
/// impl or a `BTreeMap` indirection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub image: String,
    pub size_bytes: u64,
    pub hotplug_bytes: u64,
    pub overlay_size_bytes: u64,
    pub vcpus: u32,
    pub env: BTreeMap<String, String>,
    pub network_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub volumes: Vec<VolumeAttachment>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub kernel_version: String,
    pub hypervisor_type: HypervisorKind,
    pub hypervisor_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypervisor_pid: Option<u32>,
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub vsock_cid: u32,
    pub vsock_socket: PathBuf,
    pub devices: Vec<String>,
}

/// Which concrete backend implementation owns this instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorKind {
    SocketApi,
    CmdlineMonitor,
}

/// Runtime state of an instance, derived fresh on every query (never stored).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Stopped,
    Created,
    Running,
    Paused,
    Shutdown,
    Standby,
    Unknown,
}

impl InstanceState {
    /// Transitions the Orchestrator is allowed to drive from this state,
    /// per §4.6. `Unknown` has no legal forward transition except via
    /// Delete's best-effort kill path, which does not go through this table.
    pub fn can_transition_to(self, target: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, target),
            (Created, Running)
                | (Created, Shutdown)
                | (Running, Paused)
                | (Running, Shutdown)
                | (Paused, Running)
                | (Paused, Shutdown)
                | (Paused, Standby)
                | (Shutdown, Stopped)
                | (Stopped, Created)
                | (Standby, Paused)
                | (Standby, Stopped)
        )
    }
}

/// Non-persistent, caller-facing projection of an [`Instance`] plus derived
/// fields. Never deserialized — only ever produced by the Orchestrator.
#[derive(Clone, Debug, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub instance: Instance,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_error: Option<String>,
    pub has_snapshot: bool,
}

/// Hypervisor-agnostic VM configuration, translated by each backend into its
/// own native shape (HTTP JSON payload, or flattened argv).
#[derive(Clone, Debug)]
pub struct VmConfig {
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub hotplug_bytes: u64,
    pub cpu_topology: Option<CpuTopology>,
    pub disks: Vec<DiskConfig>,
    pub networks: Vec<NetworkConfig>,
    pub serial_log_path: Option<PathBuf>,
    pub vsock_cid: u32,
    pub vsock_socket: PathBuf,
    pub pci_devices: Vec<String>,
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub kernel_args: String,
}

#[derive(Clone, Copy, Debug)]
pub struct CpuTopology {
    pub threads: u32,
    pub cores: u32,
    pub dies: u32,
    pub packages: u32,
}

#[derive(Clone, Debug)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub readonly: bool,
    pub io_bps: u64,
    pub burst_bps: u64,
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub tap_device: String,
    pub ip: String,
    pub mac: String,
    pub netmask: String,
}

/// Optional capabilities a backend may or may not support; constant per
/// backend and consulted by the Orchestrator before invoking the
/// corresponding optional operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    pub snapshot: bool,
    pub hotplug_memory: bool,
    pub pause: bool,
    pub vsock: bool,
    pub gpu_passthrough: bool,
    pub disk_io_limit: bool,
}
