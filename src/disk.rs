//! ext4 disk image creation via `mke2fs`/`debugfs`.
//!
//! One helper underlies all three disk-producing operations in the spec:
//! overlay disks (§4.2), volume overlay disks (§4.2), and the read-only
//! config disk (§4.3) — they differ only in staging content and target size.

use std::path::Path;
use std::process::Command;

use walkdir::WalkDir;

use crate::error::{VmError, VmResult};
use crate::util::find_binary;

const BLOCK_SIZE: u64 = 4096;

/// Truncate a sparse file of `size_bytes` and format it ext4, empty.
///
/// Used for `overlay.raw` and `vol-overlays/{volume_id}.raw` — both are
/// writable, pre-sized, and start out with an empty filesystem rather than
/// being populated from a staging directory.
pub fn create_sparse_ext4(path: &Path, size_bytes: u64) -> VmResult<()> {
    let file = std::fs::File::create(path)
        .map_err(|e| VmError::Internal(format!("failed to create {}: {e}", path.display())))?;
    file.set_len(size_bytes)
        .map_err(|e| VmError::Internal(format!("failed to truncate {}: {e}", path.display())))?;
    drop(file);

    let mke2fs = find_binary("mke2fs")?;
    let path_str = path.to_str().ok_or_else(|| {
        VmError::Internal(format!("non-utf8 disk path: {}", path.display()))
    })?;

    let output = Command::new(&mke2fs)
        .args(["-t", "ext4", "-b", "4096", "-m", "0", "-F", "-q", path_str])
        .output()
        .map_err(|e| VmError::Internal(format!("failed to run mke2fs: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VmError::Internal(format!(
            "mke2fs failed with {:?}: {stderr}",
            output.status.code()
        )));
    }
    Ok(())
}

/// Build a read-only ext4 image populated from `staging_dir`, sizing the
/// image automatically with overhead for ext4 metadata and journal.
///
/// Used for the config disk (§4.3), whose content (`config.sh` +
/// `metadata.json`) is generated into a small staging directory first.
pub fn create_ext4_from_dir(staging_dir: &Path, output_path: &Path) -> VmResult<()> {
    let size_bytes = calculate_disk_size(staging_dir);
    let size_blocks = size_bytes / BLOCK_SIZE;

    let output_str = output_path.to_str().ok_or_else(|| {
        VmError::Internal(format!("non-utf8 output path: {}", output_path.display()))
    })?;
    let staging_str = staging_dir.to_str().ok_or_else(|| {
        VmError::Internal(format!("non-utf8 staging path: {}", staging_dir.display()))
    })?;

    let mke2fs = find_binary("mke2fs")?;
    let output = Command::new(&mke2fs)
        .args([
            "-t",
            "ext4",
            "-b",
            "4096",
            "-d",
            staging_str,
            "-m",
            "0",
            "-E",
            "root_owner=0:0",
            "-F",
            "-q",
            output_str,
            &size_blocks.to_string(),
        ])
        .output()
        .map_err(|e| VmError::Internal(format!("failed to run mke2fs: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VmError::Internal(format!(
            "mke2fs failed with {:?}: {stderr}",
            output.status.code()
        )));
    }

    fix_ownership_with_debugfs(output_path, staging_dir)?;
    Ok(())
}

/// Estimate bytes needed to hold `dir`'s contents on ext4, including inode
/// and journal overhead, with a safety margin and a sane floor for tiny
/// config-disk payloads.
fn calculate_disk_size(dir: &Path) -> u64 {
    const INODE_SIZE: u64 = 256;
    const JOURNAL_OVERHEAD_BYTES: u64 = 16 * 1024 * 1024;
    const MIN_DISK_SIZE_BYTES: u64 = 4 * 1024 * 1024;

    let mut total_blocks = 0u64;
    let mut entry_count = 0u64;

    for entry in WalkDir::new(dir).follow_links(false).into_iter().flatten() {
        entry_count += 1;
        if let Ok(metadata) = entry.metadata() {
            if metadata.is_file() {
                total_blocks += metadata.len().div_ceil(BLOCK_SIZE).max(1);
            } else if metadata.is_dir() {
                total_blocks += 1;
            }
        }
    }

    let content_size = total_blocks * BLOCK_SIZE;
    let inode_size = entry_count * INODE_SIZE;
    let dir_size = content_size + inode_size;

    // 10% overhead margin plus journal, same ratio used for the larger
    // overlay disks; config disks are small enough the floor dominates.
    ((dir_size * 11) / 10 + JOURNAL_OVERHEAD_BYTES).max(MIN_DISK_SIZE_BYTES)
}

/// `mke2fs -E root_owner=0:0` only fixes the root inode; walk the rest of
/// the tree and set uid/gid 0 via `debugfs -w sif`.
fn fix_ownership_with_debugfs(image_path: &Path, source_dir: &Path) -> VmResult<()> {
    let current_uid = unsafe { libc::getuid() };
    let current_gid = unsafe { libc::getgid() };
    if current_uid == 0 && current_gid == 0 {
        return Ok(());
    }

    let mut commands = String::new();
    for entry in WalkDir::new(source_dir).follow_links(false).into_iter().flatten() {
        let rel_path = entry.path().strip_prefix(source_dir).unwrap_or(entry.path());
        if rel_path.as_os_str().is_empty() {
            continue;
        }
        let ext4_path = format!("/{}", rel_path.display());
        commands.push_str(&format!("sif {ext4_path} uid 0\n"));
        commands.push_str(&format!("sif {ext4_path} gid 0\n"));
    }

    if commands.is_empty() {
        return Ok(());
    }

    let debugfs = find_binary("debugfs")?;
    use std::io::Write;
    let mut child = Command::new(&debugfs)
        .args(["-w", "-f", "-"])
        .arg(image_path)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| VmError::Internal(format!("failed to spawn debugfs: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(commands.as_bytes())
            .map_err(|e| VmError::Internal(format!("failed to write debugfs stdin: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| VmError::Internal(format!("failed to wait for debugfs: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::warn!("debugfs ownership fix had errors: {stderr}");
    }
    Ok(())
}
