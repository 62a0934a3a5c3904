//! Graceful Shutdown
//!
//! One shutdown latch observed by the scheduler, the acceptor and every
//! connection read loop, plus a count of live read loops so the node can wait
//! for them to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Shutdown coordinator shared by every task of a node.
#[derive(Clone)]
pub struct ShutdownController {
    signal: Arc<watch::Sender<bool>>,
    active_connections: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
            active_connections: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Trip the latch. Idempotent.
    pub fn shutdown(&self) {
        if !self.signal.send_replace(true) {
            tracing::info!(
                "shutdown signaled, {} connections still open",
                self.active_connections()
            );
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once shutdown has been signaled, immediately if it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in self, so this only errors if the latch can never trip.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Number of read loops currently running.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Track one read loop for the lifetime of the returned guard.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            controller: self.clone(),
        }
    }

    fn connection_ended(&self) {
        if self.active_connections.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until no read loop is running, up to `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = self.drained.notified();
        tokio::pin!(drained);
        drained.as_mut().enable();

        if self.active_connections() == 0 {
            return true;
        }

        tokio::select! {
            _ = drained => true,
            _ = tokio::time::sleep(timeout) => {
                let remaining = self.active_connections();
                if remaining > 0 {
                    tracing::warn!("drain timeout: {} connections still active", remaining);
                }
                remaining == 0
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one running read loop.
pub struct ConnectionGuard {
    controller: ShutdownController,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.controller.connection_ended();
    }
}

/// Resolve on Ctrl+C or SIGTERM, then trip `controller`.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    controller.shutdown();
}
