//! Runs every configured controller concurrently until asked to stop.
use crate::controller::PollingController;
use crate::error::AppResult;
use futures::future::join_all;
use std::future::Future;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// A set of independent polling controllers.
#[derive(Default)]
pub struct Scheduler {
    controllers: Vec<PollingController>,
}

impl Scheduler {
    /// An empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a controller; it starts when the scheduler runs.
    pub fn add_controller(&mut self, controller: PollingController) {
        info!("Scheduling {} every {:?}", controller.name(), controller.interval());
        self.controllers.push(controller);
    }

    /// Number of scheduled controllers.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether no controller is scheduled.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Names of the scheduled sources, in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.controllers.iter().map(PollingController::name).collect()
    }

    /// Runs until Ctrl-C or SIGTERM.
    pub async fn run_all(self) -> AppResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `stop` resolves, then signals every controller and waits
    /// for all of them to finish their teardown.
    pub async fn run_until<F>(self, stop: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        if self.controllers.is_empty() {
            warn!("No sources to poll; nothing to do");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles: Vec<_> = self
            .controllers
            .into_iter()
            .map(|mut controller| {
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    let name = controller.name().to_string();
                    let result = controller.run(shutdown).await;
                    (name, result)
                })
            })
            .collect();
        info!("Started {} controllers", handles.len());

        stop.await;
        info!("Shutdown requested, stopping controllers");
        shutdown_tx.send_replace(true);

        for joined in join_all(handles).await {
            match joined {
                Ok((name, Ok(()))) => info!("{} stopped", name),
                Ok((name, Err(e))) => error!("{} ended with an error: {}", name, e),
                Err(e) => error!("Controller task failed: {}", e),
            }
        }
        info!("All controllers stopped");
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
