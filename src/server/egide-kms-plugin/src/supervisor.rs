//! The supervisor run loop.
//!
//! Blocks until the first of: an OS termination signal, a plugin server
//! failure, a health check server failure. Exactly one shutdown reason is
//! produced per process; the caller drives the actual teardown.

use std::fmt;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

use crate::error::ServeError;

/// Why the process is shutting down. The first observed trigger wins.
#[derive(Debug)]
pub enum ShutdownReason {
    /// An OS termination signal was captured.
    Signal(&'static str),
    /// The plugin server's serve loop failed.
    Plugin(ServeError),
    /// The health check server's serve loop failed.
    Health(ServeError),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "captured {}", name),
            Self::Plugin(err) => write!(f, "plugin server failed: {}", err),
            Self::Health(err) => write!(f, "health check server failed: {}", err),
        }
    }
}

/// Waits for the first shutdown trigger.
///
/// The failure channels are one-shot and buffered: a failure sent while this
/// function is not yet polling is still delivered, never dropped. A channel
/// whose sender disappeared without a message counts as a failure of that
/// server too.
pub async fn wait_for_shutdown(
    plugin_failure: &mut oneshot::Receiver<ServeError>,
    health_failure: &mut oneshot::Receiver<ServeError>,
) -> anyhow::Result<ShutdownReason> {
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let reason = tokio::select! {
        _ = sigint.recv() => ShutdownReason::Signal("SIGINT"),
        _ = sigterm.recv() => ShutdownReason::Signal("SIGTERM"),
        failure = plugin_failure => {
            ShutdownReason::Plugin(failure.unwrap_or(ServeError::Stopped))
        },
        failure = health_failure => {
            ShutdownReason::Health(failure.unwrap_or(ServeError::Stopped))
        },
    };

    Ok(reason)
}

// ============================================================================
// Tests
// ============================================================================
