//! Server lifecycle: health state and accounting of supervised execution units.
//!
//! Uses `ArcSwap` for lock-free health state transitions and atomic counters
//! for the isolated units launched by the execution supervisor. A unit that
//! outlives its request's deadline keeps running until it observes
//! cancellation; such units are counted as orphaned so the leak is visible
//! on the health endpoint instead of silent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Server health state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionStats
// ---------------------------------------------------------------------------

/// Counters describing the isolated units launched by the supervisor.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    in_flight: AtomicU64,
    orphaned: AtomicU64,
    late_completions: AtomicU64,
    timeouts: AtomicU64,
    panics: AtomicU64,
}

impl ExecutionStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Units currently running, orphaned ones included.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Units still running after their request was answered with a timeout.
    #[must_use]
    pub fn orphaned(&self) -> u64 {
        self.orphaned.load(Ordering::Acquire)
    }

    /// Results produced after a timeout response had already been committed.
    #[must_use]
    pub fn late_completions(&self) -> u64 {
        self.late_completions.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Acquire)
    }

    pub(crate) fn unit_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unit_finished(&self, was_orphaned: bool) {
        if was_orphaned {
            self.orphaned.fetch_sub(1, Ordering::AcqRel);
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Must happen-before the unit can observe that the deadline won.
    pub(crate) fn orphan_marked(&self) {
        self.orphaned.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn orphan_unmarked(&self) {
        self.orphaned.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn late_completion(&self) {
        self.late_completions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn panicked(&self) {
        self.panics.fetch_add(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Coordinates health reporting and graceful shutdown.
///
/// 1. Health probes read `health_state()`
/// 2. `trigger_shutdown()` moves to Draining so readiness probes fail
/// 3. `wait_for_drain()` waits until no supervised unit is in flight
#[derive(Debug)]
pub struct Lifecycle {
    stats: Arc<ExecutionStats>,
    health_state: Arc<ArcSwap<HealthState>>,
}

impl Lifecycle {
    /// Creates a lifecycle in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stats: Arc::new(ExecutionStats::new()),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Transitions to `Draining`.
    pub fn trigger_shutdown(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Shared execution counters, handed to the supervisor layer.
    #[must_use]
    pub fn stats(&self) -> Arc<ExecutionStats> {
        Arc::clone(&self.stats)
    }

    /// Waits until no supervised unit is in flight, up to `timeout`.
    ///
    /// Returns `true` and transitions to `Stopped` on success; returns
    /// `false` and stays `Draining` if the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.stats.in_flight() == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
