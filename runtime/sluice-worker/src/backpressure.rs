//! Ack-driven flow control plus coarse memory-pressure sampling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice_db::{CancelToken, QueryId};
use sysinfo::{Pid, System};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackpressureConfig {
    /// Chunks a query may have sent but not yet acknowledged.
    pub max_outstanding: usize,
    pub poll_interval_ms: u64,
    pub memory_check_interval_ms: u64,
    pub memory_threshold_bytes: u64,
    /// Cooperative pause after a reclamation hint.
    pub reclaim_pause_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 2,
            poll_interval_ms: 10,
            memory_check_interval_ms: 1000,
            memory_threshold_bytes: 1536 * 1024 * 1024,
            reclaim_pause_ms: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    Active,
    /// Cancel requested; no more chunks, outstanding acks still drain.
    Draining,
    /// Untracked: never emitted, fully drained, or ended.
    Closed,
}

#[derive(Debug)]
struct QueryFlow {
    outstanding: usize,
    state: FlowState,
}

/// Per-worker flow state, keyed by query id.
#[derive(Debug)]
pub struct BackpressureGovernor {
    config: BackpressureConfig,
    flows: Mutex<HashMap<QueryId, QueryFlow>>,
    capacity: Notify,
    reclaim_requested: AtomicBool,
}

impl BackpressureGovernor {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            flows: Mutex::new(HashMap::new()),
            capacity: Notify::new(),
            reclaim_requested: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    pub fn can_emit(&self, query_id: &str) -> bool {
        match self.flows().get(query_id) {
            Some(flow) => {
                flow.state == FlowState::Active && flow.outstanding < self.config.max_outstanding
            }
            None => true,
        }
    }

    /// Registers the query on its first chunk.
    pub fn on_emit(&self, query_id: &str) {
        let mut flows = self.flows();
        let flow = flows
            .entry(query_id.to_string())
            .or_insert(QueryFlow {
                outstanding: 0,
                state: FlowState::Active,
            });
        flow.outstanding += 1;
    }

    /// Acks need not match chunks one to one; only the count matters.
    pub fn on_ack(&self, query_id: &str) {
        {
            let mut flows = self.flows();
            let Some(flow) = flows.get_mut(query_id) else {
                debug!(query_id, "ack for untracked query");
                return;
            };
            flow.outstanding = flow.outstanding.saturating_sub(1);
            if flow.state == FlowState::Draining && flow.outstanding == 0 {
                flows.remove(query_id);
            }
        }
        self.capacity.notify_waiters();
    }

    pub fn request_drain(&self, query_id: &str) {
        {
            let mut flows = self.flows();
            if let Some(flow) = flows.get_mut(query_id) {
                flow.state = FlowState::Draining;
                if flow.outstanding == 0 {
                    flows.remove(query_id);
                }
            }
        }
        self.capacity.notify_waiters();
    }

    pub fn on_query_end(&self, query_id: &str) {
        self.flows().remove(query_id);
        self.capacity.notify_waiters();
    }

    pub fn state(&self, query_id: &str) -> FlowState {
        self.flows()
            .get(query_id)
            .map_or(FlowState::Closed, |flow| flow.state)
    }

    pub fn outstanding(&self, query_id: &str) -> usize {
        self.flows()
            .get(query_id)
            .map_or(0, |flow| flow.outstanding)
    }

    pub fn tracked(&self) -> usize {
        self.flows().len()
    }

    /// Waits until `query_id` may emit another chunk. Returns `false` when the
    /// query was cancelled or put into draining instead.
    pub async fn wait_for_capacity(&self, query_id: &str, cancel: &CancelToken) -> bool {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let notified = self.capacity.notified();
            if cancel.is_cancelled() || self.state(query_id) == FlowState::Draining {
                return false;
            }
            if self.can_emit(query_id) {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Returns whether the sample crossed the threshold.
    pub fn record_memory_sample(&self, bytes: u64) -> bool {
        let over = bytes > self.config.memory_threshold_bytes;
        if over {
            debug!(bytes, threshold = self.config.memory_threshold_bytes, "memory pressure");
            self.reclaim_requested.store(true, Ordering::SeqCst);
        }
        over
    }

    /// Consumes a pending reclamation request.
    pub fn take_reclaim_request(&self) -> bool {
        self.reclaim_requested.swap(false, Ordering::SeqCst)
    }

    pub fn reclaim_pause(&self) -> Duration {
        Duration::from_millis(self.config.reclaim_pause_ms)
    }

    fn flows(&self) -> MutexGuard<'_, HashMap<QueryId, QueryFlow>> {
        self.flows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Source of resident-memory samples.
pub trait MemoryProbe: Send {
    fn sample(&mut self) -> Option<u64>;
}

/// Resident set size of the current process.
pub struct ProcessMemory {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(error = %err, "process id unavailable; memory sampling disabled");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemory {
    fn sample(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system.refresh_all();
        self.system.process(pid).map(|process| process.memory())
    }
}

/// Samples `probe` every `memory_check_interval_ms` until the governor is
/// dropped.
pub fn spawn_memory_monitor(
    governor: &Arc<BackpressureGovernor>,
    mut probe: Box<dyn MemoryProbe>,
) -> JoinHandle<()> {
    let period = Duration::from_millis(governor.config.memory_check_interval_ms.max(1));
    let governor: Weak<BackpressureGovernor> = Arc::downgrade(governor);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(governor) = governor.upgrade() else {
                break;
            };
            let sampled = tokio::task::spawn_blocking(move || {
                let sample = probe.sample();
                (probe, sample)
            })
            .await;
            match sampled {
                Ok((returned, sample)) => {
                    probe = returned;
                    if let Some(bytes) = sample {
                        governor.record_memory_sample(bytes);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "memory probe failed; sampling stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn governor(max_outstanding: usize) -> BackpressureGovernor {
        BackpressureGovernor::new(BackpressureConfig {
            max_outstanding,
            ..BackpressureConfig::default()
        })
    }

    #[test]
    fn gate_closes_at_ceiling_and_reopens_on_ack() {
        let governor = governor(2);
        assert!(governor.can_emit("q"));
        governor.on_emit("q");
        assert!(governor.can_emit("q"));
        governor.on_emit("q");
        assert!(!governor.can_emit("q"));
        governor.on_ack("q");
        assert!(governor.can_emit("q"));
        assert_eq!(governor.state("q"), FlowState::Active);
    }

    #[test]
    fn queries_are_tracked_independently() {
        let governor = governor(1);
        governor.on_emit("a");
        assert!(!governor.can_emit("a"));
        assert!(governor.can_emit("b"));
    }

    #[test]
    fn draining_closes_when_acks_arrive() {
        let governor = governor(2);
        governor.on_emit("q");
        governor.on_emit("q");
        governor.request_drain("q");
        assert_eq!(governor.state("q"), FlowState::Draining);
        assert!(!governor.can_emit("q"));
        governor.on_ack("q");
        governor.on_ack("q");
        assert_eq!(governor.state("q"), FlowState::Closed);
        assert_eq!(governor.tracked(), 0);
    }

    #[test]
    fn end_removes_tracking() {
        let governor = governor(2);
        governor.on_emit("q");
        governor.on_query_end("q");
        assert_eq!(governor.tracked(), 0);
        governor.on_ack("q");
        assert_eq!(governor.outstanding("q"), 0);
    }

    #[test]
    fn memory_threshold_requests_reclaim_once() {
        let governor = BackpressureGovernor::new(BackpressureConfig {
            memory_threshold_bytes: 100,
            ..BackpressureConfig::default()
        });
        assert!(!governor.record_memory_sample(100));
        assert!(!governor.take_reclaim_request());
        assert!(governor.record_memory_sample(101));
        assert!(governor.take_reclaim_request());
        assert!(!governor.take_reclaim_request());
    }

    #[tokio::test]
    async fn waiter_wakes_on_ack() {
        let governor = Arc::new(governor(1));
        governor.on_emit("q");
        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move { governor.wait_for_capacity("q", &CancelToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        governor.on_ack("q");
        let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woke")
            .expect("join");
        assert!(granted);
    }

    #[tokio::test]
    async fn waiter_gives_up_on_cancel() {
        let governor = Arc::new(governor(1));
        governor.on_emit("q");
        let token = CancelToken::new();
        let waiter = {
            let governor = governor.clone();
            let token = token.clone();
            tokio::spawn(async move { governor.wait_for_capacity("q", &token).await })
        };
        token.cancel();
        let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woke")
            .expect("join");
        assert!(!granted);
    }

    struct FixedProbe(u64);

    impl MemoryProbe for FixedProbe {
        fn sample(&mut self) -> Option<u64> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn monitor_flags_pressure() {
        let governor = Arc::new(BackpressureGovernor::new(BackpressureConfig {
            memory_threshold_bytes: 10,
            memory_check_interval_ms: 5,
            ..BackpressureConfig::default()
        }));
        let monitor = spawn_memory_monitor(&governor, Box::new(FixedProbe(11)));
        let mut flagged = false;
        for _ in 0..100 {
            if governor.take_reclaim_request() {
                flagged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        monitor.abort();
        assert!(flagged);
    }

    #[test]
    fn process_memory_reports_something() {
        let mut probe = ProcessMemory::new();
        assert!(probe.sample().is_some_and(|bytes| bytes > 0));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Emit,
        Ack,
    }

    proptest! {
        #[test]
        fn outstanding_is_conserved(
            ops in proptest::collection::vec(prop_oneof![Just(Op::Emit), Just(Op::Ack)], 0..200),
            ceiling in 1usize..6,
        ) {
            let governor = governor(ceiling);
            let mut model: usize = 0;
            for op in ops {
                match op {
                    Op::Emit => {
                        governor.on_emit("q");
                        model += 1;
                    }
                    Op::Ack => {
                        let before = governor.outstanding("q");
                        governor.on_ack("q");
                        model = model.saturating_sub(1);
                        if before >= ceiling && before - 1 < ceiling {
                            prop_assert!(governor.can_emit("q"));
                        }
                    }
                }
                prop_assert_eq!(governor.outstanding("q"), model);
                prop_assert_eq!(governor.can_emit("q"), model < ceiling);
            }
        }
    }
}
