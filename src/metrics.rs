//! Metrics/Tracing sink (spec §2 component 8): observer-only counters and
//! duration samples for each orchestration flow. The Orchestrator records
//! into this; it never reads its own counters back to make decisions.
//!
//! Grounded on the corpus's metrics module shape: a plain-old-data storage
//! struct of `AtomicU64` counters behind `Arc`, paired with a cloneable,
//! read-only handle — the same split used there between
//! `RuntimeMetricsStorage`/`RuntimeMetrics` and `BoxMetricsStorage`/
//! `BoxMetrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One of the six multi-hop orchestrations named in §4.7, used to index
/// per-flow counters and duration samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Create,
    Standby,
    Restore,
    Start,
    Stop,
    Delete,
}

const FLOW_COUNT: usize = 6;

impl Flow {
    fn index(self) -> usize {
        match self {
            Flow::Create => 0,
            Flow::Standby => 1,
            Flow::Restore => 2,
            Flow::Start => 3,
            Flow::Stop => 4,
            Flow::Delete => 5,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Flow::Create => "create",
            Flow::Standby => "standby",
            Flow::Restore => "restore",
            Flow::Start => "start",
            Flow::Stop => "stop",
            Flow::Delete => "delete",
        }
    }
}

/// Storage for process-wide metrics. All counters are monotonic; cheap to
/// clone (only `Arc` pointers), shared between the Orchestrator and every
/// caller holding a `RuntimeMetrics` handle.
#[derive(Clone, Default)]
pub struct RuntimeMetricsStorage {
    attempted: [Arc<AtomicU64>; FLOW_COUNT],
    succeeded: [Arc<AtomicU64>; FLOW_COUNT],
    failed: [Arc<AtomicU64>; FLOW_COUNT],
    /// Most recently observed flow duration, in milliseconds.
    last_duration_ms: [Arc<AtomicU64>; FLOW_COUNT],
    /// Cleanup-stack steps that failed during unwind (§7: logged, swallowed).
    cleanup_steps_failed: Arc<AtomicU64>,
    /// Total state transitions observed across all instances (§4.6).
    state_transitions: Arc<AtomicU64>,
}

impl RuntimeMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_attempt(&self, flow: Flow) {
        self.attempted[flow.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, flow: Flow, result: &Result<(), ()>, duration: Duration) {
        match result {
            Ok(()) => {
                self.succeeded[flow.index()].fetch_add(1, Ordering::Relaxed);
            }
            Err(()) => {
                self.failed[flow.index()].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.last_duration_ms[flow.index()].store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_cleanup_step_failure(&self) {
        self.cleanup_steps_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_state_transition(&self) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handle(&self) -> RuntimeMetrics {
        RuntimeMetrics {
            storage: self.clone(),
        }
    }
}

/// Cloneable, read-only view over [`RuntimeMetricsStorage`] handed to
/// embedders that want to export these counters (e.g. to a Prometheus
/// registry) without holding the Orchestrator itself.
#[derive(Clone)]
pub struct RuntimeMetrics {
    storage: RuntimeMetricsStorage,
}

impl RuntimeMetrics {
    pub fn attempted_total(&self, flow: Flow) -> u64 {
        self.storage.attempted[flow.index()].load(Ordering::Relaxed)
    }

    pub fn succeeded_total(&self, flow: Flow) -> u64 {
        self.storage.succeeded[flow.index()].load(Ordering::Relaxed)
    }

    pub fn failed_total(&self, flow: Flow) -> u64 {
        self.storage.failed[flow.index()].load(Ordering::Relaxed)
    }

    pub fn last_duration_ms(&self, flow: Flow) -> u64 {
        self.storage.last_duration_ms[flow.index()].load(Ordering::Relaxed)
    }

    pub fn cleanup_steps_failed_total(&self) -> u64 {
        self.storage.cleanup_steps_failed.load(Ordering::Relaxed)
    }

    pub fn state_transitions_total(&self) -> u64 {
        self.storage.state_transitions.load(Ordering::Relaxed)
    }
}

/// RAII-ish helper: records attempt on construction, outcome+duration on
/// `finish`. Not `Drop`-based (a dropped-without-finish guard deliberately
/// records nothing — a panic mid-flow should not silently count as success).
pub(crate) struct FlowTimer<'a> {
    storage: &'a RuntimeMetricsStorage,
    flow: Flow,
    started: std::time::Instant,
}

impl<'a> FlowTimer<'a> {
    pub(crate) fn start(storage: &'a RuntimeMetricsStorage, flow: Flow) -> Self {
        storage.record_attempt(flow);
        Self {
            storage,
            flow,
            started: std::time::Instant::now(),
        }
    }

    pub(crate) fn finish<T, E>(self, result: &Result<T, E>) {
        let outcome = if result.is_ok() { Ok(()) } else { Err(()) };
        self.storage
            .record_outcome(self.flow, &outcome, self.started.elapsed());
        tracing::debug!(
            flow = self.flow.label(),
            ok = result.is_ok(),
            "orchestration flow completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_timer_records_success_and_duration() {
        let storage = RuntimeMetricsStorage::new();
        let handle = storage.handle();

        let timer = FlowTimer::start(&storage, Flow::Create);
        std::thread::sleep(Duration::from_millis(5));
        let result: Result<(), VmErrorStub> = Ok(());
        timer.finish(&result);

        assert_eq!(handle.attempted_total(Flow::Create), 1);
        assert_eq!(handle.succeeded_total(Flow::Create), 1);
        assert_eq!(handle.failed_total(Flow::Create), 0);
    }

    #[test]
    fn flow_timer_records_failure() {
        let storage = RuntimeMetricsStorage::new();
        let handle = storage.handle();

        let timer = FlowTimer::start(&storage, Flow::Delete);
        let result: Result<(), VmErrorStub> = Err(VmErrorStub);
        timer.finish(&result);

        assert_eq!(handle.attempted_total(Flow::Delete), 1);
        assert_eq!(handle.failed_total(Flow::Delete), 1);
    }

    #[test]
    fn cleanup_and_state_transition_counters_are_independent_per_storage() {
        let storage = RuntimeMetricsStorage::new();
        storage.record_cleanup_step_failure();
        storage.record_state_transition();
        storage.record_state_transition();

        let handle = storage.handle();
        assert_eq!(handle.cleanup_steps_failed_total(), 1);
        assert_eq!(handle.state_transitions_total(), 2);
    }

    #[derive(Debug)]
    struct VmErrorStub;
}
