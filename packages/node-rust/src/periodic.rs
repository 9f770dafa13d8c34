//! Fixed-rate background tasks with an initial delay.
//!
//! A [`Periodic`] implementation supplies the tick body; [`PeriodicHandle`]
//! owns the spawned loop. Dropping the handle stops the loop.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

// ---------------------------------------------------------------------------
// Periodic trait
// ---------------------------------------------------------------------------

/// Body of a periodic task.
#[async_trait]
pub trait Periodic: Send + 'static {
    /// Task name used in logs.
    fn name(&self) -> &'static str;

    /// One tick of work.
    async fn tick(&mut self) -> anyhow::Result<()>;
}

/// What a failed tick does to the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnTickError {
    /// Cancel the schedule.
    Stop,
    /// Log and keep ticking.
    Continue,
}

/// When a periodic task runs.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub initial_delay: Duration,
    pub period: Duration,
    pub on_error: OnTickError,
}

impl Schedule {
    /// Runs every `period`, starting immediately.
    #[must_use]
    pub fn every(period: Duration) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            period,
            on_error: OnTickError::Continue,
        }
    }

    /// Sets the delay before the first run.
    #[must_use]
    pub fn after(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Stops the schedule after the first failed tick.
    #[must_use]
    pub fn stop_on_error(mut self) -> Self {
        self.on_error = OnTickError::Stop;
        self
    }
}

// ---------------------------------------------------------------------------
// PeriodicHandle
// ---------------------------------------------------------------------------

/// Handle to a spawned periodic loop.
#[derive(Debug)]
pub struct PeriodicHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicHandle {
    /// Spawns `task` on the current runtime.
    ///
    /// The first tick runs after `initial_delay`, then every `period`. A slow
    /// tick delays the following ones rather than bursting to catch up.
    pub fn spawn<P: Periodic>(mut task: P, schedule: Schedule) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = &mut shutdown_rx => return,
                () = tokio::time::sleep(schedule.initial_delay) => {}
            }

            let mut interval = tokio::time::interval(schedule.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        if let Err(err) = task.tick().await {
                            match schedule.on_error {
                                OnTickError::Stop => {
                                    error!(task = task.name(), error = %err, "periodic task failed, cancelling schedule");
                                    break;
                                }
                                OnTickError::Continue => {
                                    warn!(task = task.name(), error = %err, "periodic task failed");
                                }
                            }
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Whether the loop has exited (stopped, or cancelled after an error).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the loop and waits for an in-progress tick to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
