//! Runtime configuration (spec §1.1): this crate is a library embedded into
//! a host process, not a daemon with its own config-file parser, so
//! `RuntimeConfig` is constructed programmatically by the embedder and
//! handed to the Orchestrator at construction time. Loading it from TOML,
//! env vars, or a CLI flag set is the embedder's job.

use std::path::PathBuf;
use std::time::Duration;

/// Per-instance resource defaults and caps, plus the fixed operation
/// timeouts from §5. Every numeric default here mirrors Create flow step 4
/// and the per-operation timeout list in §5 exactly.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// `{root}` in the Path Resolver's `{root}/guests/{id}` layout.
    pub data_root: PathBuf,

    /// Applied when a Create request omits the corresponding field.
    pub default_size_bytes: u64,
    pub default_hotplug_bytes: u64,
    pub default_overlay_size_bytes: u64,
    pub default_vcpus: u32,

    /// Per-instance resource caps (Create flow step 5).
    pub max_vcpus_per_instance: u32,
    pub max_memory_bytes_per_instance: u64,
    pub max_overlay_bytes_per_instance: u64,

    /// Aggregate caps, checked by summing size+hotplug and vcpus across all
    /// instances in {Created, Running, Paused} (Create flow step 5).
    pub max_aggregate_memory_bytes: u64,
    pub max_aggregate_vcpus: u32,

    /// Fixed per-operation timeouts (§5): migration, socket-ready,
    /// memory-stabilization, process-exit, vsock dial.
    pub migration_timeout: Duration,
    pub socket_ready_timeout: Duration,
    pub memory_stabilize_timeout: Duration,
    pub process_exit_timeout: Duration,
    pub vsock_dial_timeout: Duration,

    /// Standby flow step 6: wait up to this long for graceful pid exit
    /// after the API-level shutdown request.
    pub graceful_shutdown_timeout: Duration,

    /// Poll intervals paired with the deadlines above.
    pub socket_ready_poll_interval: Duration,
    pub process_exit_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/microvm"),
            default_size_bytes: 1024 * 1024 * 1024,
            default_hotplug_bytes: 3 * 1024 * 1024 * 1024,
            default_overlay_size_bytes: 10 * 1024 * 1024 * 1024,
            default_vcpus: 2,
            max_vcpus_per_instance: 16,
            max_memory_bytes_per_instance: 32 * 1024 * 1024 * 1024,
            max_overlay_bytes_per_instance: 100 * 1024 * 1024 * 1024,
            max_aggregate_memory_bytes: 256 * 1024 * 1024 * 1024,
            max_aggregate_vcpus: 128,
            migration_timeout: Duration::from_secs(30),
            socket_ready_timeout: Duration::from_secs(10),
            memory_stabilize_timeout: Duration::from_secs(5),
            process_exit_timeout: Duration::from_secs(5),
            vsock_dial_timeout: Duration::from_secs(5),
            graceful_shutdown_timeout: Duration::from_secs(2),
            socket_ready_poll_interval: Duration::from_millis(100),
            process_exit_poll_interval: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_create_flow_step_4() {
        let config = RuntimeConfig::default();
        assert_eq!(config.default_size_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.default_hotplug_bytes, 3 * 1024 * 1024 * 1024);
        assert_eq!(config.default_overlay_size_bytes, 10 * 1024 * 1024 * 1024);
        assert_eq!(config.default_vcpus, 2);
    }

    #[test]
    fn defaults_match_fixed_operation_timeouts() {
        let config = RuntimeConfig::default();
        assert_eq!(config.migration_timeout, Duration::from_secs(30));
        assert_eq!(config.socket_ready_timeout, Duration::from_secs(10));
        assert_eq!(config.memory_stabilize_timeout, Duration::from_secs(5));
        assert_eq!(config.process_exit_timeout, Duration::from_secs(5));
        assert_eq!(config.vsock_dial_timeout, Duration::from_secs(5));
    }
}
