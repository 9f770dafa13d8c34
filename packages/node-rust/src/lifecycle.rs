//! Node lifecycle: readiness state, drain signalling, in-flight work tracking.
//!
//! State lives in an `ArcSwap` so health probes read it without locking.
//! Work units hold an [`InFlightGuard`] while they run; draining waits for
//! the counter to reach zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::info;

/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Listeners are being bound; no work accepted yet.
    Starting,
    /// Consuming requests.
    Ready,
    /// No new work is taken; in-flight work finishes.
    Draining,
    /// All in-flight work completed.
    Stopped,
}

impl NodeState {
    /// Lowercase name used in health output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    /// Whether new work may start in this state.
    #[must_use]
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }
}

/// Shared lifecycle handle for one node process.
#[derive(Debug)]
pub struct NodeLifecycle {
    drain_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<NodeState>,
}

impl NodeLifecycle {
    /// Creates a lifecycle in `Starting` with no work in flight.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            drain_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(NodeState::Starting),
        }
    }

    /// Marks the node ready. Ignored once draining has begun.
    pub fn set_ready(&self) {
        if self.state().accepts_work() {
            self.state.store(Arc::new(NodeState::Ready));
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        **self.state.load()
    }

    /// Moves to `Draining` and wakes every [`NodeLifecycle::drained`] waiter.
    ///
    /// Idempotent; returns `true` only for the call that started the drain.
    pub fn begin_drain(&self) -> bool {
        let previous = self.state.swap(Arc::new(NodeState::Draining));
        if !previous.accepts_work() {
            // Keep Stopped if we already got there.
            self.state.store(previous);
            return false;
        }
        info!(previous = previous.as_str(), "node draining");
        // Stored even with no receivers, so later `drained()` calls see it.
        self.drain_signal.send_replace(true);
        true
    }

    /// Receiver flipped to `true` when draining starts.
    #[must_use]
    pub fn drain_receiver(&self) -> watch::Receiver<bool> {
        self.drain_signal.subscribe()
    }

    /// Resolves once draining has started.
    pub async fn drained(&self) {
        let mut rx = self.drain_signal.subscribe();
        // A closed channel means the lifecycle is being torn down; stop waiting.
        let _ = rx.wait_for(|draining| *draining).await;
    }

    /// Counts a unit of work until the guard drops, panics included.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Units of work currently in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits up to `timeout` for in-flight work to finish.
    ///
    /// On success the node moves to `Stopped` and `true` is returned; on
    /// timeout the state is left unchanged.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(NodeState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for NodeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
