//! Signal handling for graceful shutdown

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::debug;

/// Handles shutdown signals (SIGTERM, SIGINT)
pub struct ShutdownSignal;

impl ShutdownSignal {
    /// Create a new shutdown signal handler
    pub fn new() -> Self {
        Self
    }

    /// Wait for a shutdown signal.
    ///
    /// Fails only if a handler cannot be registered.
    pub async fn wait(&self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                debug!("received SIGTERM");
            }
            _ = sigint.recv() => {
                debug!("received SIGINT");
            }
        }
        Ok(())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
