//! Path Resolver — a pure mapping from `(data_root, instance_id)` to the
//! deterministic per-instance file layout described in spec §4.1 / §6.
//!
//! Every other component consumes paths through this resolver; there is no
//! ad-hoc path concatenation anywhere else in the crate.

use std::path::{Path, PathBuf};

use crate::model::HypervisorKind;

/// Directory and file name constants, kept together so the layout is easy
/// to audit against the filesystem-layout section of the spec in one place.
pub mod names {
    pub const GUESTS_DIR: &str = "guests";
    pub const METADATA_FILE: &str = "metadata.json";
    pub const OVERLAY_FILE: &str = "overlay.raw";
    pub const CONFIG_DISK_FILE: &str = "config.ext4";
    pub const VSOCK_SOCKET_FILE: &str = "vsock.sock";
    pub const LOGS_DIR: &str = "logs";
    pub const APP_LOG_FILE: &str = "app.log";
    pub const VMM_LOG_FILE: &str = "vmm.log";
    pub const HYPEMAN_LOG_FILE: &str = "hypeman.log";
    pub const SNAPSHOTS_DIR: &str = "snapshots";
    pub const SNAPSHOT_LATEST_DIR: &str = "snapshot-latest";
    pub const VOL_OVERLAYS_DIR: &str = "vol-overlays";
}

/// Resolves every path that belongs to a single instance from
/// `(data_root, instance_id)`. Cheap to construct; carries no state beyond
/// the two inputs, so it is safe to build one per call rather than caching.
#[derive(Clone, Debug)]
pub struct PathResolver {
    data_root: PathBuf,
}

impl PathResolver {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Root directory for all instances: `{root}/guests`
    pub fn guests_dir(&self) -> PathBuf {
        self.data_root.join(names::GUESTS_DIR)
    }

    /// Per-instance directory: `{root}/guests/{id}`
    pub fn data_dir(&self, instance_id: &str) -> PathBuf {
        self.guests_dir().join(instance_id)
    }

    pub fn metadata_path(&self, instance_id: &str) -> PathBuf {
        self.data_dir(instance_id).join(names::METADATA_FILE)
    }

    pub fn overlay_disk_path(&self, instance_id: &str) -> PathBuf {
        self.data_dir(instance_id).join(names::OVERLAY_FILE)
    }

    pub fn config_disk_path(&self, instance_id: &str) -> PathBuf {
        self.data_dir(instance_id).join(names::CONFIG_DISK_FILE)
    }

    /// Control-socket path; the filename is backend-kind-specific, registered
    /// alongside the backend implementation at startup (§9).
    pub fn backend_socket_path(&self, instance_id: &str, kind: HypervisorKind) -> PathBuf {
        self.data_dir(instance_id).join(backend_socket_filename(kind))
    }

    /// Host-side vsock multiplexer socket (SocketAPI backend only; AF_VSOCK
    /// dialing does not use a filesystem path).
    pub fn vsock_socket_path(&self, instance_id: &str) -> PathBuf {
        self.data_dir(instance_id).join(names::VSOCK_SOCKET_FILE)
    }

    pub fn logs_dir(&self, instance_id: &str) -> PathBuf {
        self.data_dir(instance_id).join(names::LOGS_DIR)
    }

    /// Guest serial console output, written directly by the backend.
    pub fn app_log_path(&self, instance_id: &str) -> PathBuf {
        self.logs_dir(instance_id).join(names::APP_LOG_FILE)
    }

    /// Backend process stdout+stderr.
    pub fn vmm_log_path(&self, instance_id: &str) -> PathBuf {
        self.logs_dir(instance_id).join(names::VMM_LOG_FILE)
    }

    /// Optional structured operational log.
    pub fn hypeman_log_path(&self, instance_id: &str) -> PathBuf {
        self.logs_dir(instance_id).join(names::HYPEMAN_LOG_FILE)
    }

    pub fn snapshots_dir(&self, instance_id: &str) -> PathBuf {
        self.data_dir(instance_id).join(names::SNAPSHOTS_DIR)
    }

    pub fn snapshot_latest_dir(&self, instance_id: &str) -> PathBuf {
        self.snapshots_dir(instance_id).join(names::SNAPSHOT_LATEST_DIR)
    }

    pub fn vol_overlays_dir(&self, instance_id: &str) -> PathBuf {
        self.data_dir(instance_id).join(names::VOL_OVERLAYS_DIR)
    }

    pub fn vol_overlay_disk_path(&self, instance_id: &str, volume_id: &str) -> PathBuf {
        self.vol_overlays_dir(instance_id)
            .join(format!("{volume_id}.raw"))
    }

    /// CmdLine+Monitor backend: the saved argv-replay config written at
    /// `start_vm` time, consumed again on snapshot and on restore (§4.4.b).
    pub fn qemu_config_path(&self, instance_id: &str) -> PathBuf {
        self.data_dir(instance_id).join("qemu-config.json")
    }
}

/// Per-kind control socket filename, e.g. `ch.sock` / `qemu.sock`.
pub fn backend_socket_filename(kind: HypervisorKind) -> &'static str {
    match kind {
        HypervisorKind::SocketApi => "ch.sock",
        HypervisorKind::CmdlineMonitor => "qemu.sock",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_deterministic() {
        let r1 = PathResolver::new("/data");
        let r2 = PathResolver::new("/data");
        assert_eq!(r1.data_dir("abc"), r2.data_dir("abc"));
    }

    #[test]
    fn data_dir_is_under_guests() {
        let r = PathResolver::new("/data");
        assert_eq!(r.data_dir("abc123"), PathBuf::from("/data/guests/abc123"));
    }

    #[test]
    fn socket_filename_is_kind_specific() {
        let r = PathResolver::new("/data");
        assert_eq!(
            r.backend_socket_path("id", HypervisorKind::SocketApi),
            PathBuf::from("/data/guests/id/ch.sock")
        );
        assert_eq!(
            r.backend_socket_path("id", HypervisorKind::CmdlineMonitor),
            PathBuf::from("/data/guests/id/qemu.sock")
        );
    }

    #[test]
    fn vol_overlay_path_scopes_by_volume_id() {
        let r = PathResolver::new("/data");
        assert_eq!(
            r.vol_overlay_disk_path("id", "vol-1"),
            PathBuf::from("/data/guests/id/vol-overlays/vol-1.raw")
        );
    }
}
