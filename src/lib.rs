//! Hypervisor-agnostic control plane for KVM-backed microVMs running OCI
//! container images.
//!
//! # Overview
//!
//! - [`Orchestrator`]: the Manager — Create/Standby/Restore/Delete/Start/Stop
//!   flows over per-instance VM lifecycle, wired to a dual backend
//!   abstraction (`SocketApi` vs `CmdlineMonitor` hypervisors) and a set of
//!   embedder-supplied collaborators (image resolution, networking, volumes,
//!   PCI device passthrough, kernel selection).
//! - [`model::Instance`] / [`model::InstanceView`]: the persisted record and
//!   its derived, caller-facing projection. State is never stored — it is
//!   recomputed on every query from the filesystem and the live backend.
//! - [`backend`]: the `Backend`/`Handle` trait pair plus the inventory-based
//!   registry that dispatches on [`model::HypervisorKind`] at runtime.
//! - [`storage`]: the on-disk layout under `{data_root}/guests/{id}/...` and
//!   atomic metadata persistence.
//! - [`vsock`]: guest I/O channel dialers, one per hypervisor kind.
//! - [`logging::init_hypeman_log`]: optional `tracing` file-sink helper for
//!   embedders that want the operational log routed to disk.
//!
//! # Example
//!
//! ```rust,no_run
//! use microvm_core::{CreateRequest, Orchestrator, RuntimeConfig};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     image_resolver: Arc<dyn microvm_core::collaborators::ImageResolver>,
//! #     network_allocator: Arc<dyn microvm_core::collaborators::NetworkAllocator>,
//! #     volume_service: Arc<dyn microvm_core::collaborators::VolumeService>,
//! #     device_service: Arc<dyn microvm_core::collaborators::DeviceService>,
//! #     system_service: Arc<dyn microvm_core::collaborators::SystemService>,
//! # ) -> microvm_core::VmResult<()> {
//! let orchestrator = Orchestrator::new(
//!     RuntimeConfig::default(),
//!     image_resolver,
//!     network_allocator,
//!     volume_service,
//!     device_service,
//!     system_service,
//! );
//!
//! let view = orchestrator
//!     .create(CreateRequest {
//!         name: "demo".to_string(),
//!         image: "alpine:latest".to_string(),
//!         size_bytes: None,
//!         hotplug_bytes: None,
//!         overlay_size_bytes: None,
//!         vcpus: None,
//!         env: BTreeMap::new(),
//!         network_enabled: true,
//!         volumes: Vec::new(),
//!         devices: Vec::new(),
//!         hypervisor_kind: None,
//!         hypervisor_version: "1.0".to_string(),
//!         kernel_version: "6.1".to_string(),
//!     })
//!     .await?;
//! println!("{}: {:?}", view.instance.id, view.state);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod collaborators;
pub mod config;
pub mod configdisk;
pub mod disk;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod path;
pub mod storage;
pub mod util;
pub mod vsock;

pub use config::RuntimeConfig;
pub use error::{VmError, VmResult};
pub use logging::init_hypeman_log;
pub use metrics::{Flow, RuntimeMetrics};
pub use model::{HypervisorKind, Instance, InstanceState, InstanceView};
pub use orchestrator::{CreateRequest, Orchestrator};
