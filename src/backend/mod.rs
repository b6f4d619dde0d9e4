//! Hypervisor abstraction (spec §4.4): a capability-bearing `Backend` trait
//! dispatched by [`crate::model::HypervisorKind`], plus the `Handle` each
//! backend hands back from `start_vm`/`restore_vm`.
//!
//! Concrete implementations register themselves at link time via
//! `inventory::submit!` in [`registry`], the same distributed-registration
//! idiom used for engine dispatch elsewhere in the corpus.

pub mod cmdline;
pub mod registry;
pub mod socketapi;

use std::path::Path;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::VmResult;
use crate::model::{Capabilities, HypervisorKind, InstanceState, VmConfig};

pub use registry::{create_backend, create_vsock_dialer, BackendRegistration};

/// Point-in-time status read off a live backend process.
#[derive(Clone, Copy, Debug)]
pub struct VmInfo {
    pub state: InstanceState,
    pub memory_actual_bytes: Option<u64>,
}

/// A hypervisor backend implementation (§4.4). Object-safe so the
/// Orchestrator can hold `Arc<dyn Backend>` chosen by `HypervisorKind` at
/// construction time rather than a generic parameter per backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Constant per backend; never changes at runtime.
    fn capabilities(&self) -> Capabilities;

    /// Spawn the backend process and bring the VM to `Created`/`Running`.
    /// Returns the child pid and a live `Handle`.
    async fn start_vm(
        &self,
        ctx: &CancellationToken,
        version: &str,
        socket_path: &Path,
        config: &VmConfig,
    ) -> VmResult<(u32, Box<dyn Handle>)>;

    /// Spawn the backend process from a snapshot. The VM ends in `Paused`.
    async fn restore_vm(
        &self,
        ctx: &CancellationToken,
        version: &str,
        socket_path: &Path,
        snapshot_path: &Path,
    ) -> VmResult<(u32, Box<dyn Handle>)>;

    /// Open a `Handle` onto an already-running backend process, identified
    /// only by its control socket (used by state derivation and by flows
    /// resuming control of an instance across process restarts).
    async fn attach(&self, ctx: &CancellationToken, socket_path: &Path) -> VmResult<Box<dyn Handle>>;
}

/// A live connection to one running backend process (spec §4.4).
#[async_trait]
pub trait Handle: Send + Sync {
    async fn get_vm_info(&self, ctx: &CancellationToken) -> VmResult<VmInfo>;
    async fn pause(&self, ctx: &CancellationToken) -> VmResult<()>;
    async fn resume(&self, ctx: &CancellationToken) -> VmResult<()>;
    async fn snapshot(&self, ctx: &CancellationToken, dest_path: &Path) -> VmResult<()>;
    async fn resize_memory(&self, ctx: &CancellationToken, bytes: u64) -> VmResult<()>;

    /// Issue a resize then poll until memory_actual_bytes is unchanged for
    /// 3 consecutive reads or `timeout` elapses — both outcomes are success
    /// (Q1: a stabilized-above-target result is not itself an error).
    async fn resize_memory_and_wait(
        &self,
        ctx: &CancellationToken,
        bytes: u64,
        timeout: std::time::Duration,
    ) -> VmResult<()>;

    /// Ask the guest to shut down gracefully.
    async fn delete_vm(&self, ctx: &CancellationToken) -> VmResult<()>;

    /// Stop the backend process itself.
    async fn shutdown(&self, ctx: &CancellationToken) -> VmResult<()>;
}

/// A thunk pushed onto a per-flow cleanup stack; see §4.7 and §9.
pub type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
