//! SocketAPI backend (spec §4.4.a): configure-then-boot over an HTTP-like
//! API exposed on a Unix socket by a long-running VMM process.
//!
//! Grounded on the corpus's HTTP-over-Unix-socket control-plane client: one
//! `request(method, path, body)` helper centralizes status-code handling,
//! with thin endpoint-specific wrappers (`create_vm`, `boot`, `pause`, ...)
//! on top, matching the generic-request-plus-typed-wrapper shape used there.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::registry::BackendRegistration;
use crate::backend::{Backend, Handle, VmInfo};
use crate::error::{VmError, VmResult};
use crate::model::{Capabilities, HypervisorKind, InstanceState, VmConfig};
use crate::util::find_binary;
use crate::vsock;

const BACKEND_BINARY: &str = "cloud-hypervisor";
const SOCKET_READY_DEADLINE: Duration = Duration::from_secs(10);
const SOCKET_READY_POLL: Duration = Duration::from_millis(100);
const MEMORY_STABILIZE_POLL: Duration = Duration::from_millis(20);
const MEMORY_STABILIZE_READS: u32 = 3;

inventory::submit! {
    BackendRegistration {
        kind: HypervisorKind::SocketApi,
        backend_ctor: construct,
        dialer_ctor: vsock::socketapi::construct,
    }
}

fn construct() -> Arc<dyn Backend> {
    Arc::new(SocketApiBackend::new())
}

pub struct SocketApiBackend {
    client: Client<UnixConnector, Full<Bytes>>,
}

impl SocketApiBackend {
    pub fn new() -> Self {
        Self {
            client: Client::unix(),
        }
    }
}

impl Default for SocketApiBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for SocketApiBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshot: true,
            hotplug_memory: true,
            pause: true,
            vsock: true,
            gpu_passthrough: true,
            disk_io_limit: true,
        }
    }

    async fn start_vm(
        &self,
        ctx: &CancellationToken,
        _version: &str,
        socket_path: &Path,
        config: &VmConfig,
    ) -> VmResult<(u32, Box<dyn Handle>)> {
        let pid = spawn_backend(socket_path)?;
        crate::util::wait_for_unix_socket(ctx, socket_path, SOCKET_READY_DEADLINE, SOCKET_READY_POLL)
            .await?;

        let client = ApiClient::new(self.client.clone(), socket_path.to_path_buf());

        let payload = NativeVmConfig::from(config);
        client.request(ctx, Method::POST, "vm.create", Some(&payload)).await?;
        client
            .request::<(), ()>(ctx, Method::PUT, "vm.boot", None)
            .await?;

        if config.hotplug_bytes > 0 {
            let resize = ResizeRequest {
                desired_ram: config.memory_bytes + config.hotplug_bytes,
            };
            // Best-effort: hotplug resize failures here do not fail start_vm.
            if let Err(e) = client.request(ctx, Method::PUT, "vm.resize", Some(&resize)).await {
                tracing::warn!(error = %e, "best-effort post-boot hotplug resize failed");
            }
        }

        Ok((pid, Box::new(SocketApiHandle { client })))
    }

    async fn restore_vm(
        &self,
        ctx: &CancellationToken,
        _version: &str,
        socket_path: &Path,
        snapshot_path: &Path,
    ) -> VmResult<(u32, Box<dyn Handle>)> {
        let pid = spawn_backend(socket_path)?;
        crate::util::wait_for_unix_socket(ctx, socket_path, SOCKET_READY_DEADLINE, SOCKET_READY_POLL)
            .await?;

        let client = ApiClient::new(self.client.clone(), socket_path.to_path_buf());
        let restore = RestoreRequest {
            source_url: format!("file://{}", snapshot_path.display()),
            prefault: false,
        };
        client.request(ctx, Method::PUT, "vm.restore", Some(&restore)).await?;

        Ok((pid, Box::new(SocketApiHandle { client })))
    }

    async fn attach(&self, _ctx: &CancellationToken, socket_path: &Path) -> VmResult<Box<dyn Handle>> {
        let client = ApiClient::new(self.client.clone(), socket_path.to_path_buf());
        Ok(Box::new(SocketApiHandle { client }))
    }
}

/// Spawn the VMM binary with only the arguments needed to open its control
/// socket (§4.4.a) — the binary is a long-running process; all other config
/// arrives over the API after the socket is ready.
fn spawn_backend(socket_path: &Path) -> VmResult<u32> {
    let binary = find_binary(BACKEND_BINARY)?;
    let child = std::process::Command::new(&binary)
        .arg("--api-socket")
        .arg(socket_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| VmError::Transport(format!("failed to spawn {BACKEND_BINARY}: {e}")))?;
    Ok(child.id())
}

struct ApiClient {
    http: Client<UnixConnector, Full<Bytes>>,
    socket_path: PathBuf,
}

impl ApiClient {
    fn new(http: Client<UnixConnector, Full<Bytes>>, socket_path: PathBuf) -> Self {
        Self { http, socket_path }
    }

    /// Issue one API call and map the response into the crate's error
    /// taxonomy. `endpoint` is appended to `/api/v1/`. A 204 with no body
    /// is treated as success with an empty response; any other non-2xx
    /// status becomes `VmError::Transport` carrying the response body.
    async fn request<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        ctx: &CancellationToken,
        method: Method,
        endpoint: &str,
        body: Option<&Req>,
    ) -> VmResult<Option<Resp>> {
        if ctx.is_cancelled() {
            return Err(VmError::Cancelled);
        }

        let path = format!("/api/v1/{endpoint}");
        let uri: hyper::Uri = UnixUri::new(&self.socket_path, &path).into();

        let body_bytes = match body {
            Some(b) => Bytes::from(serde_json::to_vec(b)?),
            None => Bytes::new(),
        };

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(body_bytes))
            .map_err(|e| VmError::Internal(format!("failed to build request: {e}")))?;

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(VmError::Cancelled),
            result = self.http.request(request) => result.map_err(|e| {
                VmError::Transport(format!("{endpoint} request failed: {e}"))
            })?,
        };

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| VmError::Transport(format!("{endpoint} failed reading body: {e}")))?
            .to_bytes();

        match status {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                if body.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(serde_json::from_slice(&body)?))
                }
            }
            other => Err(VmError::Transport(format!(
                "{endpoint} returned {other}: {}",
                String::from_utf8_lossy(&body)
            ))),
        }
    }
}

struct SocketApiHandle {
    client: ApiClient,
}

#[async_trait]
impl Handle for SocketApiHandle {
    async fn get_vm_info(&self, ctx: &CancellationToken) -> VmResult<VmInfo> {
        let info: NativeVmInfo = self
            .client
            .request::<(), NativeVmInfo>(ctx, Method::GET, "vm.info", None)
            .await?
            .ok_or_else(|| VmError::Transport("vm.info returned no body".to_string()))?;

        let state = match info.state.as_str() {
            "Created" => InstanceState::Created,
            "Running" => InstanceState::Running,
            "Paused" => InstanceState::Paused,
            "Shutdown" => InstanceState::Shutdown,
            other => {
                return Err(VmError::Transport(format!("vm.info returned unrecognized state {other}")))
            }
        };

        Ok(VmInfo {
            state,
            memory_actual_bytes: info.memory_actual_size,
        })
    }

    async fn pause(&self, ctx: &CancellationToken) -> VmResult<()> {
        self.client
            .request::<(), ()>(ctx, Method::PUT, "vm.pause", None)
            .await?;
        Ok(())
    }

    async fn resume(&self, ctx: &CancellationToken) -> VmResult<()> {
        self.client
            .request::<(), ()>(ctx, Method::PUT, "vm.resume", None)
            .await?;
        Ok(())
    }

    async fn snapshot(&self, ctx: &CancellationToken, dest_path: &Path) -> VmResult<()> {
        let req = SnapshotRequest {
            destination_url: format!("file://{}", dest_path.display()),
        };
        self.client
            .request::<_, ()>(ctx, Method::PUT, "vm.snapshot", Some(&req))
            .await?;
        Ok(())
    }

    async fn resize_memory(&self, ctx: &CancellationToken, bytes: u64) -> VmResult<()> {
        let req = ResizeRequest { desired_ram: bytes };
        self.client
            .request::<_, ()>(ctx, Method::PUT, "vm.resize", Some(&req))
            .await?;
        Ok(())
    }

    /// Issue the resize, then poll `vm.info` every 20ms until
    /// `memory_actual_bytes` is unchanged for 3 consecutive reads or
    /// `timeout` elapses (Q1: both outcomes are success).
    async fn resize_memory_and_wait(
        &self,
        ctx: &CancellationToken,
        bytes: u64,
        timeout: Duration,
    ) -> VmResult<()> {
        self.resize_memory(ctx, bytes).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut last: Option<u64> = None;
        let mut stable_reads = 0u32;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Ok(());
            }
            if ctx.is_cancelled() {
                return Err(VmError::Cancelled);
            }

            let info = self.get_vm_info(ctx).await?;
            match (last, info.memory_actual_bytes) {
                (Some(prev), Some(curr)) if prev == curr => {
                    stable_reads += 1;
                    if stable_reads >= MEMORY_STABILIZE_READS {
                        return Ok(());
                    }
                }
                (_, curr) => {
                    stable_reads = 1;
                    last = curr;
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(VmError::Cancelled),
                _ = tokio::time::sleep(MEMORY_STABILIZE_POLL) => {}
            }
        }
    }

    async fn delete_vm(&self, ctx: &CancellationToken) -> VmResult<()> {
        self.client
            .request::<(), ()>(ctx, Method::PUT, "vm.delete", None)
            .await?;
        Ok(())
    }

    async fn shutdown(&self, ctx: &CancellationToken) -> VmResult<()> {
        self.client
            .request::<(), ()>(ctx, Method::PUT, "vmm.shutdown", None)
            .await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct NativeVmConfig {
    payload: PayloadConfig,
    cpus: CpusConfig,
    memory: MemoryConfig,
    disks: Vec<NativeDisk>,
    serial: SerialConfig,
    console: ConsoleConfig,
    net: Vec<NativeNet>,
    vsock: NativeVsock,
    devices: Vec<NativeDevice>,
}

#[derive(Serialize)]
struct PayloadConfig {
    kernel: PathBuf,
    cmdline: String,
    initramfs: PathBuf,
}

#[derive(Serialize)]
struct CpusConfig {
    boot_vcpus: u32,
    max_vcpus: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    topology: Option<NativeTopology>,
}

#[derive(Serialize)]
struct NativeTopology {
    threads_per_core: u32,
    cores_per_die: u32,
    dies_per_package: u32,
    packages: u32,
}

#[derive(Serialize)]
struct MemoryConfig {
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    hotplug_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hotplug_method: Option<&'static str>,
}

#[derive(Serialize)]
struct NativeDisk {
    path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    readonly: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limiter: Option<RateLimiter>,
}

#[derive(Serialize)]
struct RateLimiter {
    bandwidth: TokenBucket,
}

#[derive(Serialize)]
struct TokenBucket {
    size: u64,
    refill_time_ms: u64,
    one_time_burst: u64,
}

#[derive(Serialize)]
struct SerialConfig {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<PathBuf>,
}

#[derive(Serialize)]
struct ConsoleConfig {
    mode: &'static str,
}

#[derive(Serialize)]
struct NativeNet {
    tap: String,
    ip: String,
    mac: String,
    mask: String,
}

#[derive(Serialize)]
struct NativeVsock {
    cid: u32,
    socket: PathBuf,
}

#[derive(Serialize)]
struct NativeDevice {
    path: String,
}

impl From<&VmConfig> for NativeVmConfig {
    fn from(c: &VmConfig) -> Self {
        NativeVmConfig {
            payload: PayloadConfig {
                kernel: c.kernel_path.clone(),
                cmdline: c.kernel_args.clone(),
                initramfs: c.initrd_path.clone(),
            },
            cpus: CpusConfig {
                boot_vcpus: c.vcpus,
                max_vcpus: c.vcpus,
                topology: c.cpu_topology.map(|t| NativeTopology {
                    threads_per_core: t.threads,
                    cores_per_die: t.cores,
                    dies_per_package: t.dies,
                    packages: t.packages,
                }),
            },
            memory: MemoryConfig {
                size: c.memory_bytes,
                hotplug_size: (c.hotplug_bytes > 0).then_some(c.hotplug_bytes),
                hotplug_method: (c.hotplug_bytes > 0).then_some("VirtioMem"),
            },
            disks: c
                .disks
                .iter()
                .map(|d| NativeDisk {
                    path: d.path.clone(),
                    readonly: d.readonly.then_some(true),
                    rate_limiter: (d.io_bps > 0).then(|| RateLimiter {
                        bandwidth: TokenBucket {
                            size: d.io_bps,
                            refill_time_ms: 1000,
                            one_time_burst: d.burst_bps.saturating_sub(d.io_bps),
                        },
                    }),
                })
                .collect(),
            serial: SerialConfig {
                mode: "File",
                file: c.serial_log_path.clone(),
            },
            console: ConsoleConfig { mode: "Off" },
            net: c
                .networks
                .iter()
                .map(|n| NativeNet {
                    tap: n.tap_device.clone(),
                    ip: n.ip.clone(),
                    mac: n.mac.clone(),
                    mask: n.netmask.clone(),
                })
                .collect(),
            vsock: NativeVsock {
                cid: c.vsock_cid,
                socket: c.vsock_socket.clone(),
            },
            devices: c
                .pci_devices
                .iter()
                .map(|p| NativeDevice { path: p.clone() })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct RestoreRequest {
    source_url: String,
    prefault: bool,
}

#[derive(Serialize)]
struct SnapshotRequest {
    destination_url: String,
}

#[derive(Serialize)]
struct ResizeRequest {
    desired_ram: u64,
}

#[derive(Deserialize)]
struct NativeVmInfo {
    state: String,
    #[serde(default)]
    memory_actual_size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiskConfig;

    #[test]
    fn native_config_translates_disk_io_limit_to_token_bucket() {
        let config = VmConfig {
            vcpus: 1,
            memory_bytes: 1024,
            hotplug_bytes: 0,
            cpu_topology: None,
            disks: vec![DiskConfig {
                path: PathBuf::from("/tmp/overlay.raw"),
                readonly: false,
                io_bps: 1_000_000,
                burst_bps: 2_000_000,
            }],
            networks: Vec::new(),
            serial_log_path: None,
            vsock_cid: 3,
            vsock_socket: PathBuf::from("/tmp/vsock.sock"),
            pci_devices: Vec::new(),
            kernel_path: PathBuf::from("/boot/vmlinux"),
            initrd_path: PathBuf::from("/boot/initrd"),
            kernel_args: String::new(),
        };

        let native = NativeVmConfig::from(&config);
        let bucket = native.disks[0].rate_limiter.as_ref().unwrap();
        assert_eq!(bucket.bandwidth.size, 1_000_000);
        assert_eq!(bucket.bandwidth.one_time_burst, 1_000_000);
    }

    #[test]
    fn hotplug_zero_omits_hotplug_fields() {
        let config = VmConfig {
            vcpus: 1,
            memory_bytes: 1024,
            hotplug_bytes: 0,
            cpu_topology: None,
            disks: Vec::new(),
            networks: Vec::new(),
            serial_log_path: None,
            vsock_cid: 3,
            vsock_socket: PathBuf::from("/tmp/vsock.sock"),
            pci_devices: Vec::new(),
            kernel_path: PathBuf::from("/boot/vmlinux"),
            initrd_path: PathBuf::from("/boot/initrd"),
            kernel_args: String::new(),
        };
        let native = NativeVmConfig::from(&config);
        assert!(native.memory.hotplug_size.is_none());
        assert!(native.memory.hotplug_method.is_none());
    }
}
