//! CmdLine+Monitor backend (spec §4.4.b): all VM configuration is flattened
//! to process arguments at spawn; the control channel is a line-delimited
//! JSON monitor protocol over a Unix socket.
//!
//! Grounded on the corpus's child-process-spawn idiom (`Command::new(...)
//! .args(...).stdin/stdout/stderr(Stdio::...).spawn()`, mapped spawn errors)
//! for process supervision, and on the newline-delimited JSON control
//! protocol pattern found elsewhere in the corpus for the monitor itself.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::backend::registry::BackendRegistration;
use crate::backend::{Backend, Handle, VmInfo};
use crate::error::{VmError, VmResult};
use crate::model::{Capabilities, HypervisorKind, InstanceState, VmConfig};
use crate::util::find_binary;
use crate::vsock;

const SOCKET_READY_DEADLINE: Duration = Duration::from_secs(10);
const SOCKET_READY_POLL: Duration = Duration::from_millis(100);
const RESTORE_PAUSE_DEADLINE: Duration = Duration::from_secs(10);
const RESTORE_PAUSE_POLL: Duration = Duration::from_millis(100);
const MIGRATION_DEADLINE: Duration = Duration::from_secs(30);
const MIGRATION_POLL: Duration = Duration::from_millis(200);
const MDEV_SYSFS_PREFIX: &str = "/sys/bus/mdev/devices/";

inventory::submit! {
    BackendRegistration {
        kind: HypervisorKind::CmdlineMonitor,
        backend_ctor: construct,
        dialer_ctor: vsock::afvsock::construct,
    }
}

fn construct() -> Arc<dyn Backend> {
    Arc::new(CmdlineMonitorBackend)
}

fn qemu_binary_name() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "qemu-system-aarch64"
    } else {
        "qemu-system-x86_64"
    }
}

fn machine_type() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "virt,accel=kvm"
    } else {
        "q35,accel=kvm"
    }
}

/// The argv-replay payload written to `qemu-config.json` at `start_vm` time
/// and reloaded, unmodified, at restore time (§4.4.b, Q2).
#[derive(Serialize, Deserialize, Clone)]
struct QemuArgvConfig {
    args: Vec<String>,
}

/// Build the full flattened argument list for one VM (§4.4.b).
fn build_args(config: &VmConfig, socket_path: &Path) -> Vec<String> {
    let mut args = Vec::new();

    args.push("-machine".to_string());
    args.push(machine_type().to_string());
    args.push("-cpu".to_string());
    args.push("host".to_string());
    args.push("-smp".to_string());
    args.push(config.vcpus.to_string());
    args.push("-m".to_string());
    args.push(format!("{}M", config.memory_bytes / (1024 * 1024)));

    args.push("-chardev".to_string());
    args.push(format!(
        "socket,id=qmp,path={},server=on,wait=off",
        socket_path.display()
    ));
    args.push("-mon".to_string());
    args.push("chardev=qmp,mode=control".to_string());
    args.push("-nographic".to_string());

    args.push("-serial".to_string());
    match &config.serial_log_path {
        Some(path) => args.push(format!("file:{}", path.display())),
        None => args.push("stdio".to_string()),
    }

    for (i, disk) in config.disks.iter().enumerate() {
        let mut drive = format!(
            "file={},format=raw,if=none,id=drive{i}",
            disk.path.display()
        );
        if disk.readonly {
            drive.push_str(",readonly=on");
        }
        if disk.io_bps > 0 {
            drive.push_str(&format!(",throttling.bps-total={}", disk.io_bps));
            if disk.burst_bps > disk.io_bps {
                drive.push_str(&format!(",throttling.bps-total-max={}", disk.burst_bps));
            }
        }
        args.push("-drive".to_string());
        args.push(drive);
        args.push("-device".to_string());
        args.push(format!("virtio-blk-pci,drive=drive{i}"));
    }

    for (i, net) in config.networks.iter().enumerate() {
        args.push("-netdev".to_string());
        args.push(format!(
            "tap,id=net{i},ifname={},script=no,downscript=no",
            net.tap_device
        ));
        args.push("-device".to_string());
        args.push(format!("virtio-net-pci,netdev=net{i},mac={}", net.mac));
    }

    if config.vsock_cid > 0 {
        args.push("-device".to_string());
        args.push(format!("vhost-vsock-pci,guest-cid={}", config.vsock_cid));
    }

    for pci in &config.pci_devices {
        args.push("-device".to_string());
        if pci.starts_with(MDEV_SYSFS_PREFIX) {
            args.push(format!("vfio-pci,sysfsdev={pci}"));
        } else {
            args.push(format!("vfio-pci,host={pci}"));
        }
    }

    args.push("-kernel".to_string());
    args.push(config.kernel_path.display().to_string());
    args.push("-initrd".to_string());
    args.push(config.initrd_path.display().to_string());
    if !config.kernel_args.is_empty() {
        args.push("-append".to_string());
        args.push(config.kernel_args.clone());
    }

    args
}

/// Spawn the VMM with `args`, stdout/stderr redirected to `logs/vmm.log`,
/// detached into its own process group (§4.4.b process supervision).
fn spawn_qemu(args: &[String], data_dir: &Path) -> VmResult<u32> {
    let log_path = data_dir.join("logs").join("vmm.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| VmError::Internal(format!("failed to open {}: {e}", log_path.display())))?;
    let log_file_stderr = log_file
        .try_clone()
        .map_err(|e| VmError::Internal(format!("failed to clone vmm.log handle: {e}")))?;

    let binary = find_binary(qemu_binary_name())?;
    let child = std::process::Command::new(&binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_stderr))
        .process_group(0)
        .spawn()
        .map_err(|e| VmError::Transport(format!("failed to spawn {}: {e}", binary.display())))?;

    Ok(child.id())
}

pub struct CmdlineMonitorBackend;

#[async_trait]
impl Backend for CmdlineMonitorBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshot: true,
            hotplug_memory: false,
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
        let data_dir = data_dir_of(socket_path)?;
        let args = build_args(config, socket_path);
        let pid = spawn_qemu(&args, &data_dir)?;

        crate::util::wait_for_unix_socket(ctx, socket_path, SOCKET_READY_DEADLINE, SOCKET_READY_POLL)
            .await?;

        let qemu_config_path = data_dir.join("qemu-config.json");
        let payload = QemuArgvConfig { args };
        std::fs::write(&qemu_config_path, serde_json::to_vec_pretty(&payload)?).map_err(|e| {
            VmError::Internal(format!("failed to write {}: {e}", qemu_config_path.display()))
        })?;

        Ok((pid, Box::new(CmdlineHandle::new(socket_path.to_path_buf()))))
    }

    async fn restore_vm(
        &self,
        ctx: &CancellationToken,
        _version: &str,
        socket_path: &Path,
        snapshot_path: &Path,
    ) -> VmResult<(u32, Box<dyn Handle>)> {
        let data_dir = data_dir_of(socket_path)?;
        let saved_config_path = snapshot_path.join("qemu-config.json");
        let bytes = std::fs::read(&saved_config_path).map_err(|e| {
            VmError::Internal(format!("failed to read {}: {e}", saved_config_path.display()))
        })?;
        let mut saved: QemuArgvConfig = serde_json::from_slice(&bytes)?;
        saved.args.push("-incoming".to_string());
        saved
            .args
            .push(format!("exec:cat < {}/memory", snapshot_path.display()));

        let pid = spawn_qemu(&saved.args, &data_dir)?;
        crate::util::wait_for_unix_socket(ctx, socket_path, SOCKET_READY_DEADLINE, SOCKET_READY_POLL)
            .await?;

        let handle = CmdlineHandle::new(socket_path.to_path_buf());
        await_paused(ctx, socket_path).await?;

        Ok((pid, Box::new(handle)))
    }

    async fn attach(&self, _ctx: &CancellationToken, socket_path: &Path) -> VmResult<Box<dyn Handle>> {
        Ok(Box::new(CmdlineHandle::new(socket_path.to_path_buf())))
    }
}

fn data_dir_of(socket_path: &Path) -> VmResult<PathBuf> {
    socket_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| VmError::Internal(format!("socket path {} has no parent", socket_path.display())))
}

/// Poll `query-status` until the VM reports `paused`, as restore leaves it
/// (§4.4.b restore flow).
async fn await_paused(ctx: &CancellationToken, socket_path: &Path) -> VmResult<()> {
    let deadline = tokio::time::Instant::now() + RESTORE_PAUSE_DEADLINE;
    loop {
        let status = query_status(ctx, socket_path).await?;
        if status == "paused" {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(VmError::Timeout {
                operation: format!("waiting for {} to reach paused after restore", socket_path.display()),
            });
        }
        tokio::select! {
            _ = ctx.cancelled() => return Err(VmError::Cancelled),
            _ = tokio::time::sleep(RESTORE_PAUSE_POLL) => {}
        }
    }
}

async fn query_status(ctx: &CancellationToken, socket_path: &Path) -> VmResult<String> {
    let result = monitor_execute(ctx, socket_path, "query-status", None).await?;
    Ok(result
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string())
}

struct CmdlineHandle {
    socket_path: PathBuf,
}

impl CmdlineHandle {
    fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }
}

#[async_trait]
impl Handle for CmdlineHandle {
    async fn get_vm_info(&self, ctx: &CancellationToken) -> VmResult<VmInfo> {
        let status = query_status(ctx, &self.socket_path).await?;
        let state = match status.as_str() {
            "running" => InstanceState::Running,
            "paused" => InstanceState::Paused,
            "shutdown" => InstanceState::Shutdown,
            "prelaunch" => InstanceState::Created,
            "inmigrate" | "postmigrate" | "finishmigrate" | "suspended" => InstanceState::Paused,
            "guest_panicked" | "io_error" | "internal_error" | "watchdog" => InstanceState::Running,
            _ => InstanceState::Unknown,
        };
        Ok(VmInfo {
            state,
            memory_actual_bytes: None,
        })
    }

    async fn pause(&self, ctx: &CancellationToken) -> VmResult<()> {
        monitor_execute(ctx, &self.socket_path, "stop", None).await?;
        Ok(())
    }

    async fn resume(&self, ctx: &CancellationToken) -> VmResult<()> {
        monitor_execute(ctx, &self.socket_path, "cont", None).await?;
        Ok(())
    }

    /// `migrate` to a file, poll `query-migrate` to completion, then copy
    /// the argv-replay config alongside the memory stream (§4.4.b).
    async fn snapshot(&self, ctx: &CancellationToken, dest_path: &Path) -> VmResult<()> {
        let uri = format!("exec:cat > {}/memory", dest_path.display());
        monitor_execute(
            ctx,
            &self.socket_path,
            "migrate",
            Some(serde_json::json!({ "uri": uri })),
        )
        .await?;

        let deadline = tokio::time::Instant::now() + MIGRATION_DEADLINE;
        loop {
            let result = monitor_execute(ctx, &self.socket_path, "query-migrate", None).await?;
            let status = result.get("status").and_then(Value::as_str).unwrap_or("");
            if status == "completed" {
                break;
            }
            if status == "failed" {
                return Err(VmError::Transport(format!(
                    "migration to {} failed",
                    dest_path.display()
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::Timeout {
                    operation: format!("migration to {}", dest_path.display()),
                });
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(VmError::Cancelled),
                _ = tokio::time::sleep(MIGRATION_POLL) => {}
            }
        }

        let data_dir = data_dir_of(&self.socket_path)?;
        let source_config = data_dir.join("qemu-config.json");
        let dest_config = dest_path.join("qemu-config.json");
        std::fs::copy(&source_config, &dest_config).map_err(|e| {
            VmError::Internal(format!(
                "failed to copy {} to {}: {e}",
                source_config.display(),
                dest_config.display()
            ))
        })?;
        Ok(())
    }

    async fn resize_memory(&self, _ctx: &CancellationToken, _bytes: u64) -> VmResult<()> {
        Err(VmError::Capability(
            "cmdline+monitor backend does not support memory hotplug".to_string(),
        ))
    }

    async fn resize_memory_and_wait(
        &self,
        _ctx: &CancellationToken,
        _bytes: u64,
        _timeout: Duration,
    ) -> VmResult<()> {
        Err(VmError::Capability(
            "cmdline+monitor backend does not support memory hotplug".to_string(),
        ))
    }

    async fn delete_vm(&self, ctx: &CancellationToken) -> VmResult<()> {
        monitor_execute(ctx, &self.socket_path, "system_powerdown", None).await?;
        Ok(())
    }

    async fn shutdown(&self, ctx: &CancellationToken) -> VmResult<()> {
        monitor_execute(ctx, &self.socket_path, "quit", None).await?;
        Ok(())
    }
}

// --- Monitor connection pool -------------------------------------------
//
// The monitor accepts only one client per socket (§4.4.b, §5); a
// process-global mapping socket_path -> connection enforces that. On any
// protocol error the entry is evicted so the next call reconnects.

struct MonitorConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MonitorConnection {
    async fn connect(ctx: &CancellationToken, socket_path: &Path) -> VmResult<Self> {
        if ctx.is_cancelled() {
            return Err(VmError::Cancelled);
        }
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| VmError::Transport(format!("monitor connect failed: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        // Discard the greeting banner, then negotiate capabilities.
        let mut banner = String::new();
        conn.reader
            .read_line(&mut banner)
            .await
            .map_err(|e| VmError::Transport(format!("failed to read monitor banner: {e}")))?;
        conn.execute("qmp_capabilities", None).await?;
        Ok(conn)
    }

    async fn execute(&mut self, command: &str, arguments: Option<Value>) -> VmResult<Value> {
        let mut request = serde_json::json!({ "execute": command });
        if let Some(args) = arguments {
            request["arguments"] = args;
        }
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| VmError::Transport(format!("monitor write failed for {command}: {e}")))?;

        let mut response_line = String::new();
        let n = self
            .reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| VmError::Transport(format!("monitor read failed for {command}: {e}")))?;
        if n == 0 {
            return Err(VmError::Transport(format!(
                "monitor connection closed while awaiting response to {command}"
            )));
        }

        let response: Value = serde_json::from_str(&response_line)?;
        if let Some(error) = response.get("error") {
            return Err(VmError::Transport(format!(
                "monitor command {command} returned error: {error}"
            )));
        }
        Ok(response.get("return").cloned().unwrap_or(Value::Null))
    }
}

type PooledConnection = Arc<AsyncMutex<Option<MonitorConnection>>>;

static MONITOR_POOL: Lazy<SyncMutex<HashMap<PathBuf, PooledConnection>>> =
    Lazy::new(|| SyncMutex::new(HashMap::new()));

fn pooled_connection(socket_path: &Path) -> PooledConnection {
    MONITOR_POOL
        .lock()
        .entry(socket_path.to_path_buf())
        .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
        .clone()
}

fn evict_connection(socket_path: &Path) {
    MONITOR_POOL.lock().remove(socket_path);
}

async fn monitor_execute(
    ctx: &CancellationToken,
    socket_path: &Path,
    command: &str,
    arguments: Option<Value>,
) -> VmResult<Value> {
    let pooled = pooled_connection(socket_path);
    let mut guard = pooled.lock().await;

    if guard.is_none() {
        *guard = Some(MonitorConnection::connect(ctx, socket_path).await?);
    }

    let conn = guard.as_mut().expect("connection populated above");
    match conn.execute(command, arguments).await {
        Ok(value) => Ok(value),
        Err(e) => {
            drop(guard);
            evict_connection(socket_path);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiskConfig, NetworkConfig};

    fn base_config() -> VmConfig {
        VmConfig {
            vcpus: 2,
            memory_bytes: 512 * 1024 * 1024,
            hotplug_bytes: 0,
            cpu_topology: None,
            disks: vec![DiskConfig {
                path: PathBuf::from("/data/overlay.raw"),
                readonly: false,
                io_bps: 0,
                burst_bps: 0,
            }],
            networks: vec![NetworkConfig {
                tap_device: "tap0".to_string(),
                ip: "10.0.0.2".to_string(),
                mac: "aa:bb:cc:dd:ee:ff".to_string(),
                netmask: "255.255.255.0".to_string(),
            }],
            serial_log_path: Some(PathBuf::from("/data/logs/app.log")),
            vsock_cid: 5,
            vsock_socket: PathBuf::from("/data/vsock.sock"),
            pci_devices: vec!["/sys/bus/mdev/devices/abc".to_string(), "0000:01:00.0".to_string()],
            kernel_path: PathBuf::from("/boot/vmlinux"),
            initrd_path: PathBuf::from("/boot/initrd"),
            kernel_args: "console=ttyS0".to_string(),
        }
    }

    #[test]
    fn build_args_includes_qmp_socket_and_machine_type() {
        let config = base_config();
        let args = build_args(&config, Path::new("/data/qemu.sock"));
        let joined = args.join(" ");
        assert!(joined.contains("socket,id=qmp,path=/data/qemu.sock,server=on,wait=off"));
        assert!(joined.contains(machine_type()));
        assert!(joined.contains("-nographic"));
    }

    #[test]
    fn build_args_maps_mdev_and_host_pci_devices_differently() {
        let config = base_config();
        let args = build_args(&config, Path::new("/data/qemu.sock"));
        let joined = args.join(" ");
        assert!(joined.contains("vfio-pci,sysfsdev=/sys/bus/mdev/devices/abc"));
        assert!(joined.contains("vfio-pci,host=0000:01:00.0"));
    }

    #[test]
    fn build_args_omits_append_when_kernel_args_empty() {
        let mut config = base_config();
        config.kernel_args.clear();
        let args = build_args(&config, Path::new("/data/qemu.sock"));
        assert!(!args.iter().any(|a| a == "-append"));
    }

    #[test]
    fn vsock_device_omitted_when_cid_zero() {
        let mut config = base_config();
        config.vsock_cid = 0;
        let args = build_args(&config, Path::new("/data/qemu.sock"));
        assert!(!args.iter().any(|a| a.contains("vhost-vsock-pci")));
    }
}
