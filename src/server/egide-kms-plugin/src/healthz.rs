//! The health check endpoint.
//!
//! Every probe is a fresh end-to-end check: a new client connection to the
//! plugin socket, one status call through it, all bounded by the configured
//! timeout. Nothing is pooled and no prior result is cached.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use egide_kms_api::{PluginClient, ProtocolError, StatusInfo};

use crate::error::ServeError;

/// Configuration for the health check server.
pub struct HealthCheck {
    path: String,
    port: u16,
    timeout: Duration,
    plugin_socket: PathBuf,
}

struct ProbeTarget {
    socket: PathBuf,
    timeout: Duration,
}

impl HealthCheck {
    /// Builds a health check server serving `path` on `port`, probing the
    /// plugin at `plugin_socket`.
    pub fn new(
        path: impl Into<String>,
        port: u16,
        timeout: Duration,
        plugin_socket: impl Into<PathBuf>,
    ) -> Self {
        Self {
            path: path.into(),
            port,
            timeout,
            plugin_socket: plugin_socket.into(),
        }
    }

    /// Binds the HTTP listener and spawns the serve loop.
    pub async fn start(self) -> Result<HealthHandle, ServeError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServeError::BindHealth { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServeError::BindHealth { addr, source })?;

        let target = Arc::new(ProbeTarget {
            socket: self.plugin_socket,
            timeout: self.timeout,
        });
        let app = Router::new()
            .route(&self.path, get(handle_probe))
            .with_state(target)
            .layer(TraceLayer::new_for_http());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (failure_tx, failure_rx) = oneshot::channel();

        info!(addr = %local_addr, path = %self.path, "listening for health checks");

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                let _ = failure_tx.send(ServeError::Health(err));
            }
        });

        Ok(HealthHandle {
            failure: failure_rx,
            addr: local_addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// Lifecycle handle for a spawned [`HealthCheck`].
pub struct HealthHandle {
    /// Fires at most once, with the error that killed the serve loop.
    pub failure: oneshot::Receiver<ServeError>,
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HealthHandle {
    /// The address the listener actually bound.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Closes the listener gracefully and waits for the loop.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

async fn handle_probe(State(target): State<Arc<ProbeTarget>>) -> (StatusCode, String) {
    match tokio::time::timeout(target.timeout, probe_status(&target.socket)).await {
        Ok(Ok(status)) => {
            debug!(key_id = %status.key_id, "health probe ok");
            (StatusCode::OK, "ok".to_string())
        },
        Ok(Err(err)) => {
            warn!(error = %err, "health probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        },
        Err(_) => {
            warn!("health probe timed out");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!(
                    "health probe timed out after {}s",
                    target.timeout.as_secs()
                ),
            )
        },
    }
}

/// One fresh status round-trip through the plugin socket.
async fn probe_status(socket: &Path) -> Result<StatusInfo, ProtocolError> {
    let mut client = PluginClient::connect(socket).await?;
    client.status().await
}

// ============================================================================
// Tests
// ============================================================================
