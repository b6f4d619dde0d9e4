//! Storage — metadata load/save, instance directory lifecycle, and
//! overlay/volume-overlay disk creation (spec §4.2).

use std::path::Path;

use crate::disk;
use crate::error::{VmError, VmResult};
use crate::model::Instance;
use crate::path::PathResolver;

#[derive(Clone, Debug)]
pub struct Storage {
    paths: PathResolver,
}

impl Storage {
    pub fn new(paths: PathResolver) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// Create `data_dir`, `logs/`, and `snapshots/` for a new instance.
    pub fn ensure_directories(&self, instance_id: &str) -> VmResult<()> {
        std::fs::create_dir_all(self.paths.data_dir(instance_id)).map_err(|e| {
            VmError::Internal(format!("failed to create data_dir for {instance_id}: {e}"))
        })?;
        std::fs::create_dir_all(self.paths.logs_dir(instance_id)).map_err(|e| {
            VmError::Internal(format!("failed to create logs dir for {instance_id}: {e}"))
        })?;
        std::fs::create_dir_all(self.paths.snapshots_dir(instance_id)).map_err(|e| {
            VmError::Internal(format!(
                "failed to create snapshots dir for {instance_id}: {e}"
            ))
        })?;
        Ok(())
    }

    /// Serialize `instance` as pretty-printed, stable-key-order JSON and
    /// write it atomically (write-temp then rename, so a crash mid-write
    /// never leaves a half-written metadata.json behind).
    pub fn save(&self, instance: &Instance) -> VmResult<()> {
        let final_path = self.paths.metadata_path(&instance.id);
        let temp_path = final_path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(instance)?;
        std::fs::write(&temp_path, &json).map_err(|e| {
            VmError::Internal(format!("failed to write {}: {e}", temp_path.display()))
        })?;
        std::fs::rename(&temp_path, &final_path).map_err(|e| {
            VmError::Internal(format!(
                "failed to rename {} to {}: {e}",
                temp_path.display(),
                final_path.display()
            ))
        })?;
        Ok(())
    }

    /// Load and parse `metadata.json`. A missing file is reported as
    /// `VmError::NotFound`, never as a generic IO failure, so callers can
    /// match on it without inspecting message text.
    pub fn load(&self, instance_id: &str) -> VmResult<Instance> {
        let path = self.paths.metadata_path(instance_id);
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VmError::NotFound(format!("instance {instance_id}"))
            } else {
                VmError::Internal(format!("failed to read {}: {e}", path.display()))
            }
        })?;
        let instance: Instance = serde_json::from_slice(&bytes)?;
        Ok(instance)
    }

    /// List every instance id that currently has a `metadata.json`, without
    /// taking any lock (§4.7 — ListInstances is unlocked and may observe a
    /// stale snapshot).
    pub fn list_ids(&self) -> VmResult<Vec<String>> {
        let guests_dir = self.paths.guests_dir();
        if !guests_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&guests_dir)
            .map_err(|e| VmError::Internal(format!("failed to list {}: {e}", guests_dir.display())))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| VmError::Internal(format!("failed to read dir entry: {e}")))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.paths.metadata_path(&id).is_file() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Truncate a sparse ext4-formatted file of `size_bytes` at the
    /// instance's overlay disk path.
    pub fn create_overlay_disk(&self, instance_id: &str, size_bytes: u64) -> VmResult<()> {
        disk::create_sparse_ext4(&self.paths.overlay_disk_path(instance_id), size_bytes)
    }

    /// Same as `create_overlay_disk`, under `vol-overlays/`.
    pub fn create_volume_overlay_disk(
        &self,
        instance_id: &str,
        volume_id: &str,
        size_bytes: u64,
    ) -> VmResult<()> {
        let overlays_dir = self.paths.vol_overlays_dir(instance_id);
        std::fs::create_dir_all(&overlays_dir).map_err(|e| {
            VmError::Internal(format!(
                "failed to create vol-overlays dir for {instance_id}: {e}"
            ))
        })?;
        disk::create_sparse_ext4(
            &self.paths.vol_overlay_disk_path(instance_id, volume_id),
            size_bytes,
        )
    }

    /// Recursively remove the entire instance directory tree. Idempotent:
    /// a missing directory is not an error (Delete may retry).
    pub fn delete_instance_data(&self, instance_id: &str) -> VmResult<()> {
        let dir = self.paths.data_dir(instance_id);
        if !dir.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&dir)
            .map_err(|e| VmError::Internal(format!("failed to remove {}: {e}", dir.display())))
    }

    /// `true` iff the snapshot directory exists and contains at least one
    /// entry (I7 — a present-but-empty directory does not count).
    pub fn has_snapshot(&self, instance_id: &str) -> bool {
        snapshot_dir_non_empty(&self.paths.snapshot_latest_dir(instance_id))
    }
}

fn snapshot_dir_non_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HypervisorKind, Instance};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn test_instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            name: "demo".to_string(),
            image: "alpine:latest".to_string(),
            size_bytes: 512 * 1024 * 1024,
            hotplug_bytes: 0,
            overlay_size_bytes: 0,
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
            socket_path: PathBuf::from("/tmp/x.sock"),
            data_dir: PathBuf::from("/tmp/x"),
            vsock_cid: 3,
            vsock_socket: PathBuf::from("/tmp/x/vsock.sock"),
            devices: Vec::new(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(PathResolver::new(tmp.path()));
        let instance = test_instance("abc123");

        storage.ensure_directories(&instance.id).unwrap();
        storage.save(&instance).unwrap();

        let loaded = storage.load(&instance.id).unwrap();
        assert_eq!(loaded.id, instance.id);
        assert_eq!(loaded.name, instance.name);
    }

    #[test]
    fn load_missing_instance_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(PathResolver::new(tmp.path()));
        let result = storage.load("does-not-exist");
        assert!(matches!(result, Err(VmError::NotFound(_))));
    }

    #[test]
    fn metadata_json_has_stable_key_order() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(PathResolver::new(tmp.path()));
        let instance = test_instance("order-check");
        storage.ensure_directories(&instance.id).unwrap();
        storage.save(&instance).unwrap();

        let raw = std::fs::read_to_string(storage.paths().metadata_path(&instance.id)).unwrap();
        let id_pos = raw.find("\"id\"").unwrap();
        let name_pos = raw.find("\"name\"").unwrap();
        assert!(id_pos < name_pos, "id must serialize before name");
    }

    #[test]
    fn delete_instance_data_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(PathResolver::new(tmp.path()));
        storage.ensure_directories("gone").unwrap();
        storage.delete_instance_data("gone").unwrap();
        // second call on an already-removed directory must not error
        storage.delete_instance_data("gone").unwrap();
    }

    #[test]
    fn has_snapshot_false_when_dir_missing_or_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(PathResolver::new(tmp.path()));
        assert!(!storage.has_snapshot("no-such-instance"));

        storage.ensure_directories("with-empty-snap").unwrap();
        std::fs::create_dir_all(storage.paths().snapshot_latest_dir("with-empty-snap")).unwrap();
        assert!(!storage.has_snapshot("with-empty-snap"));

        std::fs::write(
            storage
                .paths()
                .snapshot_latest_dir("with-empty-snap")
                .join("state.json"),
            b"{}",
        )
        .unwrap();
        assert!(storage.has_snapshot("with-empty-snap"));
    }

    #[test]
    fn list_ids_reflects_instances_with_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(PathResolver::new(tmp.path()));
        assert!(storage.list_ids().unwrap().is_empty());

        let instance = test_instance("listed-one");
        storage.ensure_directories(&instance.id).unwrap();
        storage.save(&instance).unwrap();

        let ids = storage.list_ids().unwrap();
        assert_eq!(ids, vec!["listed-one".to_string()]);
    }
}
