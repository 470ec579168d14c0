//! Fixed-rate polling of one monitor into a set of backends.
//!
//! A [`PollingController`] owns its monitor and drives it through
//! fetch → process → stamp → fan-out on a fixed schedule: cycle `n` starts at
//! `start + n * interval` regardless of how long the previous cycle took
//! (a cycle that overruns simply starts the next one immediately).
//!
//! Failures never end the loop. A failed fetch or process step is retried
//! after `min(60 s, interval)`; a failing backend is logged and the remaining
//! backends still receive the record. Only the shutdown signal stops it.
use crate::error::{AppResult, MesuraError};
use crate::interval::parse_interval;
use crate::monitor::Monitor;
use crate::record::Record;
use crate::storage::Backend;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound of the delay before retrying a failed fetch.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, `run` not called yet.
    Idle,
    /// Polling.
    Running,
    /// Shutdown requested; tearing down the monitor.
    Stopping,
    /// Finished.
    Stopped,
}

/// Resolves once `shutdown` holds `true` or its sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Polls one monitor at a fixed rate and fans each record out to its backends.
pub struct PollingController {
    monitor: Box<dyn Monitor>,
    backends: Vec<Arc<dyn Backend>>,
    interval: Duration,
    state: watch::Sender<ControllerState>,
}

impl PollingController {
    /// Creates a controller polling every `interval` (e.g. `"10m"`).
    pub fn new(
        monitor: Box<dyn Monitor>,
        backends: Vec<Arc<dyn Backend>>,
        interval: &str,
    ) -> AppResult<Self> {
        Ok(Self::with_interval(monitor, backends, parse_interval(interval)?))
    }

    /// Creates a controller with an already validated interval.
    pub fn with_interval(
        monitor: Box<dyn Monitor>,
        backends: Vec<Arc<dyn Backend>>,
        interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Idle);
        Self {
            monitor,
            backends,
            interval,
            state,
        }
    }

    /// Name of the polled source.
    pub fn name(&self) -> &str {
        self.monitor.name()
    }

    /// Time between cycle starts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Delay before retrying after a failed cycle.
    pub fn retry_delay(&self) -> Duration {
        self.interval.min(MAX_RETRY_DELAY)
    }

    fn set_state(&self, state: ControllerState) {
        self.state.send_replace(state);
    }

    /// Runs one fetch → process → stamp → write cycle.
    ///
    /// Returns the record handed to the backends. Fetch and process failures
    /// are returned; backend failures are logged and skipped.
    pub async fn poll_once(&mut self) -> AppResult<Record> {
        let raw = self.monitor.fetch().await?;
        let mut record = self.monitor.process(&raw)?;
        record.stamp_if_missing();

        let source_name = self.monitor.name();
        for backend in &self.backends {
            match backend.write(&record, source_name).await {
                Ok(()) => debug!("Wrote {} fields from {} to {}", record.len(), source_name, backend.name()),
                Err(e) => error!("Backend {} failed for {}: {}", backend.name(), source_name, e),
            }
        }
        Ok(record)
    }

    /// Polls until `shutdown` becomes `true`, then tears the monitor down.
    ///
    /// Fails with [`MesuraError::AlreadyStarted`] unless the controller is idle.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        if self.state() != ControllerState::Idle {
            return Err(MesuraError::AlreadyStarted(self.name().to_string()));
        }
        self.set_state(ControllerState::Running);
        info!("Polling {} every {:?}", self.name(), self.interval);

        loop {
            let cycle_start = Instant::now();

            let outcome = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                outcome = self.poll_once() => outcome,
            };

            let next_cycle = match outcome {
                Ok(_) => cycle_start + self.interval,
                Err(e) => {
                    let delay = self.retry_delay();
                    warn!(
                        category = %e.category(),
                        "Polling {} failed, retrying in {:?}: {}",
                        self.name(),
                        delay,
                        e
                    );
                    Instant::now() + delay
                }
            };

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = sleep_until(next_cycle) => {}
            }
        }

        self.set_state(ControllerState::Stopping);
        info!("Stopping {}", self.name());
        if let Err(e) = self.monitor.shutdown().await {
            warn!("Teardown of {} failed: {}", self.name(), e);
        }
        self.set_state(ControllerState::Stopped);
        Ok(())
    }
}
