//! PID liveness and reaping helpers used by Delete's best-effort kill path
//! and by the CmdLine+Monitor backend's process supervision.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{VmError, VmResult};

/// Check if a process with the given PID exists, using `kill(pid, 0)` which
/// sends no signal.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Send SIGKILL. Returns `true` if the process was killed or was already
/// gone; `false` only on a permission failure against a still-live process.
pub fn kill_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

/// Non-blocking wait loop: poll `is_process_alive` at `poll_interval` until
/// the process exits, the deadline elapses, or `ctx` is cancelled.
///
/// Used by Delete (§4.7 step 4, ≤5s @ 100ms) and by Standby's 2s wait for
/// graceful backend shutdown.
pub async fn wait_for_exit(
    ctx: &CancellationToken,
    pid: u32,
    deadline: Duration,
    poll_interval: Duration,
) -> VmResult<()> {
    let start = tokio::time::Instant::now();
    loop {
        if !is_process_alive(pid) {
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(VmError::Timeout {
                operation: format!("waiting for pid {pid} to exit"),
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
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn very_high_pid_is_not_alive() {
        assert!(!is_process_alive(999_999_999));
    }

    #[tokio::test]
    async fn wait_for_exit_times_out_on_live_process() {
        let ctx = CancellationToken::new();
        let result = wait_for_exit(
            &ctx,
            std::process::id(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(VmError::Timeout { .. })));
    }

    #[tokio::test]
    async fn wait_for_exit_returns_ok_for_dead_process() {
        let ctx = CancellationToken::new();
        let result = wait_for_exit(
            &ctx,
            999_999_999,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_for_exit_observes_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = wait_for_exit(
            &ctx,
            std::process::id(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(VmError::Cancelled)));
    }
}
