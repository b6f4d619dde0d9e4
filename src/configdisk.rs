//! Config Disk Builder (spec §4.3): generates the small read-only ext4 image
//! the guest init consumes at boot — `/config.sh` plus `/metadata.json`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::collaborators::{ImageInfo, NetworkAllocation};
use crate::disk::create_ext4_from_dir;
use crate::error::{VmError, VmResult};
use crate::model::{Instance, VolumeAttachment};
use crate::util::{netmask_to_cidr, shell_quote, shell_quote_array};

/// JSON-serializable mirror of the generated `config.sh`, written alongside
/// it as `/metadata.json` for programmatic access by tooling that would
/// rather not parse shell.
#[derive(Serialize)]
struct ConfigDiskMetadata {
    entrypoint: Vec<String>,
    cmd: Vec<String>,
    workdir: String,
    env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<NetMetadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<VolumeMountMetadata>,
}

#[derive(Serialize)]
struct NetMetadata {
    ip: String,
    cidr: u8,
    gateway: String,
    dns: String,
}

#[derive(Serialize)]
struct VolumeMountMetadata {
    device: String,
    mount_path: String,
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlay_device: Option<String>,
}

/// Build the config disk for `instance` at `output_path`.
///
/// `image` supplies the default entrypoint/cmd/workdir/env (instance env
/// overrides image env, per §3); `network` is present iff
/// `instance.network_enabled`.
pub fn build(
    instance: &Instance,
    image: &ImageInfo,
    network: Option<&NetworkAllocation>,
    output_path: &Path,
) -> VmResult<()> {
    let staging = tempfile::tempdir()
        .map_err(|e| VmError::Internal(format!("failed to create config disk staging dir: {e}")))?;

    let env = merge_env(&image.env, &instance.env);
    let (script, metadata) = render(instance, image, network, &env)?;

    std::fs::write(staging.path().join("config.sh"), script)
        .map_err(|e| VmError::Internal(format!("failed to write config.sh: {e}")))?;
    std::fs::write(
        staging.path().join("metadata.json"),
        serde_json::to_vec_pretty(&metadata)?,
    )
    .map_err(|e| VmError::Internal(format!("failed to write metadata.json: {e}")))?;

    create_ext4_from_dir(staging.path(), output_path)
}

fn merge_env(
    image_env: &[(String, String)],
    instance_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = image_env.iter().cloned().collect();
    for (k, v) in instance_env {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

fn render(
    instance: &Instance,
    image: &ImageInfo,
    network: Option<&NetworkAllocation>,
    env: &BTreeMap<String, String>,
) -> VmResult<(String, ConfigDiskMetadata)> {
    if instance.network_enabled && network.is_none() {
        return Err(VmError::Internal(
            "network_enabled but no NetworkAllocation supplied to config disk builder".to_string(),
        ));
    }

    let mut script = String::new();
    script.push_str(&format!(
        "ENTRYPOINT={}\n",
        shell_quote(&shell_quote_array(&image.entrypoint))
    ));
    script.push_str(&format!(
        "CMD={}\n",
        shell_quote(&shell_quote_array(&image.cmd))
    ));
    let workdir = if image.workdir.is_empty() {
        "/"
    } else {
        &image.workdir
    };
    script.push_str(&format!("WORKDIR={}\n", shell_quote(workdir)));

    for (k, v) in env {
        script.push_str(&format!("export {k}={}\n", shell_quote(v)));
    }

    let net_metadata = if let Some(alloc) = network {
        let cidr = netmask_to_cidr(&alloc.netmask);
        script.push_str(&format!("export GUEST_IP={}\n", shell_quote(&alloc.ip)));
        script.push_str(&format!("export GUEST_CIDR={}\n", shell_quote(&cidr.to_string())));
        script.push_str(&format!("export GUEST_GW={}\n", shell_quote(&alloc.gateway)));
        script.push_str(&format!("export GUEST_DNS={}\n", shell_quote(&alloc.dns)));
        Some(NetMetadata {
            ip: alloc.ip.clone(),
            cidr,
            gateway: alloc.gateway.clone(),
            dns: alloc.dns.clone(),
        })
    } else {
        None
    };

    let (mounts_line, mounts_metadata) = render_volume_mounts(&instance.volumes);
    if !instance.volumes.is_empty() {
        script.push_str(&format!("export VOLUME_MOUNTS={}\n", shell_quote(&mounts_line)));
    }

    let metadata = ConfigDiskMetadata {
        entrypoint: image.entrypoint.clone(),
        cmd: image.cmd.clone(),
        workdir: workdir.to_string(),
        env: env.clone(),
        network: net_metadata,
        volumes: mounts_metadata,
    };

    Ok((script, metadata))
}

/// Device letters start at 'd' (vda is the instance's writable root overlay,
/// vdb is this config disk, vdc is reserved); the overlay form consumes two
/// consecutive letters, every other form consumes one.
fn render_volume_mounts(volumes: &[VolumeAttachment]) -> (String, Vec<VolumeMountMetadata>) {
    let mut next_letter = b'd';
    let mut tokens = Vec::new();
    let mut metadata = Vec::new();

    for vol in volumes {
        let device = format!("vd{}", next_letter as char);
        next_letter += 1;

        if vol.overlay {
            let overlay_device = format!("vd{}", next_letter as char);
            next_letter += 1;
            tokens.push(format!(
                "{device}:{}:overlay:{overlay_device}",
                vol.mount_path
            ));
            metadata.push(VolumeMountMetadata {
                device,
                mount_path: vol.mount_path.clone(),
                mode: "overlay".to_string(),
                overlay_device: Some(overlay_device),
            });
        } else if vol.readonly {
            tokens.push(format!("{device}:{}:ro", vol.mount_path));
            metadata.push(VolumeMountMetadata {
                device,
                mount_path: vol.mount_path.clone(),
                mode: "ro".to_string(),
                overlay_device: None,
            });
        } else {
            tokens.push(format!("{device}:{}:rw", vol.mount_path));
            metadata.push(VolumeMountMetadata {
                device,
                mount_path: vol.mount_path.clone(),
                mode: "rw".to_string(),
                overlay_device: None,
            });
        }
    }

    (tokens.join(" "), metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ImageStatus;
    use crate::model::{HypervisorKind, Instance};
    use chrono::Utc;
    use std::path::PathBuf;

    fn base_instance() -> Instance {
        Instance {
            id: "abc".to_string(),
            name: "demo".to_string(),
            image: "alpine:latest".to_string(),
            size_bytes: 0,
            hotplug_bytes: 0,
            overlay_size_bytes: 0,
            vcpus: 1,
            env: BTreeMap::from([("FOO".to_string(), "instance-value".to_string())]),
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

    fn base_image() -> ImageInfo {
        ImageInfo {
            status: ImageStatus::Ready,
            entrypoint: vec!["/bin/sh".to_string()],
            cmd: vec!["-c".to_string(), "echo hi".to_string()],
            workdir: "/app".to_string(),
            env: vec![("FOO".to_string(), "image-value".to_string())],
        }
    }

    #[test]
    fn instance_env_overrides_image_env() {
        let instance = base_instance();
        let image = base_image();
        let (script, _) = render(&instance, &image, None, &merge_env(&image.env, &instance.env)).unwrap();
        assert!(script.contains("export FOO='instance-value'"));
    }

    #[test]
    fn network_disabled_omits_guest_ip() {
        let instance = base_instance();
        let image = base_image();
        let (script, metadata) =
            render(&instance, &image, None, &merge_env(&image.env, &instance.env)).unwrap();
        assert!(!script.contains("GUEST_IP"));
        assert!(metadata.network.is_none());
    }

    #[test]
    fn network_enabled_without_allocation_is_internal_error() {
        let mut instance = base_instance();
        instance.network_enabled = true;
        let image = base_image();
        let result = render(&instance, &image, None, &merge_env(&image.env, &instance.env));
        assert!(result.is_err());
    }

    #[test]
    fn volume_mounts_assign_device_letters_starting_at_d() {
        let mut instance = base_instance();
        instance.volumes = vec![
            VolumeAttachment {
                volume_id: "v1".to_string(),
                mount_path: "/data".to_string(),
                readonly: false,
                overlay: false,
                overlay_size_bytes: None,
            },
            VolumeAttachment {
                volume_id: "v2".to_string(),
                mount_path: "/ro".to_string(),
                readonly: true,
                overlay: true,
                overlay_size_bytes: Some(100 * 1024 * 1024),
            },
        ];
        let image = base_image();
        let (script, metadata) =
            render(&instance, &image, None, &merge_env(&image.env, &instance.env)).unwrap();

        assert!(script.contains("vdd:/data:rw"));
        assert!(script.contains("vde:/ro:overlay:vdf"));
        assert_eq!(metadata.volumes.len(), 2);
        assert_eq!(metadata.volumes[1].overlay_device, Some("vdf".to_string()));
    }
}
