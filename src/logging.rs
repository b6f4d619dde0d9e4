//! Optional process-wide logging initialization.
//!
//! Grounded on the corpus's own `register_to_tracing` helper
//! (`util/mod.rs`): a `tracing_subscriber::registry()` wired to a
//! `tracing_appender` non-blocking file writer, installed best-effort via
//! `try_init` so calling it twice, or calling it in a process that already
//! installed its own subscriber, is not an error.
//!
//! This crate emits `tracing` events throughout (every orchestration flow,
//! every cleanup-stack unwind step) but never installs a subscriber on its
//! own — that decision belongs to the embedder. This helper exists only to
//! make it easy to route those events into the optional
//! `logs/hypeman.log` structured operational log named in spec §6, for
//! embedders that want a file sink instead of rolling their own.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a process-wide `tracing` subscriber that writes to `path`
/// (typically `PathResolver::hypeman_log_path`), filtered by `RUST_LOG`
/// (falling back to `info` if unset).
///
/// Returns the [`WorkerGuard`] that must be kept alive for the duration of
/// the process — dropping it flushes and stops the background writer
/// thread, so an embedder should hold onto it (e.g. in `main`'s local
/// scope) rather than dropping it immediately.
pub fn init_hypeman_log(path: &Path) -> std::io::Result<WorkerGuard> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_else(|| "hypeman.log".into());

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_ansi(false),
        )
        .try_init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("logs").join("hypeman.log");
        let guard = init_hypeman_log(&log_path).unwrap();
        assert!(log_path.parent().unwrap().is_dir());
        drop(guard);
    }
}
