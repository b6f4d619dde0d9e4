//! Small, dependency-light helpers shared across backends and the
//! Orchestrator: PID liveness, shell quoting, netmask math, vsock cid
//! derivation, and binary/socket readiness checks.

pub mod netmask;
pub mod process;
pub mod quote;
pub mod vsock_cid;

use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::error::{VmError, VmResult};

pub use netmask::netmask_to_cidr;
pub use process::{is_process_alive, kill_process, wait_for_exit};
pub use quote::{shell_quote, shell_quote_array};
pub use vsock_cid::derive_vsock_cid;

/// Resolve `name` against `PATH`, the way a shell would. Backends spawn
/// their VMM binary (`qemu-system-x86_64`, a cloud-hypervisor-style binary)
/// and disk tooling (`mke2fs`, `debugfs`) by name; this keeps that lookup in
/// one place instead of relying on `Command::new` to fail late with an
/// unhelpful error.
pub fn find_binary(name: &str) -> VmResult<PathBuf> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(VmError::Internal(format!(
        "binary '{name}' not found on PATH"
    )))
}

/// Poll `connect(SOCK_STREAM, AF_UNIX, socket_path)` until it succeeds, the
/// deadline elapses, or `ctx` is cancelled. Used by both backends to wait
/// for their control socket after spawn (§4.4.a, §4.4.b).
pub async fn wait_for_unix_socket(
    ctx: &CancellationToken,
    socket_path: &std::path::Path,
    deadline: Duration,
    poll_interval: Duration,
) -> VmResult<()> {
    let start = tokio::time::Instant::now();
    loop {
        if UnixStream::connect(socket_path).await.is_ok() {
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(VmError::Timeout {
                operation: format!("waiting for socket {}", socket_path.display()),
            });
        }
        tokio::select! {
            _ = ctx.cancelled() => return Err(VmError::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_binary_locates_known_tool() {
        // `sh` is present on every Linux system this crate targets.
        assert!(find_binary("sh").is_ok());
    }

    #[test]
    fn find_binary_rejects_unknown_tool() {
        assert!(find_binary("definitely-not-a-real-binary-xyz").is_err());
    }

    #[tokio::test]
    async fn wait_for_unix_socket_times_out_when_absent() {
        let ctx = CancellationToken::new();
        let result = wait_for_unix_socket(
            &ctx,
            std::path::Path::new("/tmp/microvm-core-test-nonexistent.sock"),
            Duration::from_millis(30),
            Duration::from_millis(5),
        )
        .await;
        assert!(matches!(result, Err(VmError::Timeout { .. })));
    }
}
