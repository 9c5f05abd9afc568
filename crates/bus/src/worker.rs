//! Worker trait and lifecycle management.
//!
//! A [`Worker`] is one service role of a node (job service, storage,
//! submit proxy). [`WorkerRunner`] starts it, waits for SIGINT/SIGTERM or a
//! programmatic notification, then stops it within a timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::BusError;

// ── Worker trait ─────────────────────────────────────────────────────

#[async_trait]
pub trait Worker: Send + Sync {
    /// Called once when the worker starts. Register listeners and RPC handlers.
    async fn start(&self) -> Result<(), BusError>;

    /// Called once during graceful shutdown.
    async fn stop(&self) -> Result<(), BusError>;

    fn name(&self) -> &str;
}

// ── WorkerRunner ─────────────────────────────────────────────────────

pub struct WorkerRunner;

impl WorkerRunner {
    /// Run workers until shutdown, then stop them in reverse start order.
    ///
    /// A worker failing to start aborts the run after stopping the ones
    /// already started.
    pub async fn run(
        workers: Vec<Arc<dyn Worker>>,
        shutdown_timeout: Duration,
        shutdown_notify: Option<Arc<Notify>>,
    ) -> Result<(), BusError> {
        let mut started: Vec<Arc<dyn Worker>> = Vec::with_capacity(workers.len());
        for worker in workers {
            info!(worker = %worker.name(), "starting worker");
            if let Err(e) = worker.start().await {
                warn!(worker = %worker.name(), error = %e, "worker failed to start");
                Self::stop_all(&started, shutdown_timeout).await;
                return Err(e);
            }
            info!(worker = %worker.name(), "worker started");
            started.push(worker);
        }

        Self::wait_for_shutdown(shutdown_notify).await;
        info!(workers = started.len(), "shutdown signal received");

        Self::stop_all(&started, shutdown_timeout).await;
        info!("worker shutdown complete");
        Ok(())
    }

    async fn stop_all(workers: &[Arc<dyn Worker>], timeout: Duration) {
        for worker in workers.iter().rev() {
            let name = worker.name();
            match tokio::time::timeout(timeout, worker.stop()).await {
                Ok(Ok(())) => info!(worker = %name, "worker stopped gracefully"),
                Ok(Err(e)) => warn!(worker = %name, error = %e, "worker stop returned error"),
                Err(_) => warn!(worker = %name, "worker stop timed out, forcing shutdown"),
            }
        }
    }

    /// Wait for either an OS shutdown signal or a programmatic notification.
    async fn wait_for_shutdown(external: Option<Arc<Notify>>) {
        match external {
            Some(notify) => {
                tokio::select! {
                    _ = Self::os_signal() => {}
                    _ = notify.notified() => {}
                }
            }
            None => Self::os_signal().await,
        }
    }

    /// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
    async fn os_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigint, mut sigterm) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(i), Ok(t)) => (i, t),
                    _ => {
                        warn!("failed to register signal handlers");
                        return std::future::pending().await;
                    }
                };
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl_c");
                std::future::pending::<()>().await;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
