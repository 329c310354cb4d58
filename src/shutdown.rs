//! Graceful Shutdown Module
//!
//! Coordinates shutdown across the accept loops: a broadcast signal stops
//! every listener, after which each server drains its in-flight connection
//! workers within its configured bound.

use crate::{ProxyError, Result};
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);
        Self {
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Overall bound the process waits for components after signaling.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Blocks until SIGINT or SIGTERM, then broadcasts shutdown.
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::IoError(format!("failed to create SIGINT handler: {}", e))
            })?;
        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::IoError(format!("failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown();
        Ok(())
    }

    /// Broadcasts the shutdown signal to all subscribed components.
    pub fn initiate_shutdown(&self) {
        if let Err(e) = self.shutdown_sender.send(()) {
            // No active receivers; normal when everything already stopped.
            debug!("shutdown signal not sent (no active receivers): {}", e);
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    /// Create new shutdown signal from receiver
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&mut self) {
        match self.receiver.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                self.shutdown_requested = true;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                self.shutdown_requested = true;
            }
        }
    }
}
