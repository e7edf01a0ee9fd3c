//! The plugin protocol server.
//!
//! Serves the fixed status/encrypt/decrypt contract over a unix socket and
//! delegates every call to the backend capability. Call-level backend
//! failures are answered on the wire; only structural failures (bind, accept)
//! terminate the server.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use egide_kms_api::{
    decode_payload, encode_payload, read_message, write_message, PluginRequest, PluginResponse,
    KMS_API_VERSION,
};
use egide_kms_backend::KmsBackend;

use crate::error::ServeError;

/// Lifecycle of the plugin server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, socket not bound yet.
    Idle,
    /// Bound and accepting calls.
    Listening,
    /// Draining in-flight calls; no new connections.
    ShuttingDownGraceful,
    /// Aborting in-flight calls.
    ShuttingDownImmediate,
    /// Fully stopped.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownMode {
    Graceful,
    Immediate,
}

/// A bound, not-yet-serving plugin server.
pub struct PluginServer<B> {
    socket_path: PathBuf,
    listener: UnixListener,
    backend: Arc<B>,
    connection_timeout: Duration,
    state_tx: watch::Sender<ServerState>,
}

impl<B: KmsBackend + 'static> PluginServer<B> {
    /// Removes any stale socket file and binds the listener.
    ///
    /// A bind failure is returned to the caller; it is never retried.
    pub fn bind(
        socket_path: impl Into<PathBuf>,
        backend: Arc<B>,
        connection_timeout: Duration,
    ) -> Result<Self, ServeError> {
        let socket_path = socket_path.into();

        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!(socket = %socket_path.display(), "removed stale socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(source) => {
                return Err(ServeError::RemoveStaleSocket {
                    path: socket_path,
                    source,
                })
            },
        }

        let listener = UnixListener::bind(&socket_path).map_err(|source| ServeError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        let (state_tx, _) = watch::channel(ServerState::Idle);
        state_tx.send_replace(ServerState::Listening);
        info!(socket = %socket_path.display(), "listening on plugin socket");

        Ok(Self {
            socket_path,
            listener,
            backend,
            connection_timeout,
            state_tx,
        })
    }

    /// Spawns the accept loop and hands back its lifecycle handle.
    pub fn spawn(self) -> PluginHandle {
        let (failure_tx, failure_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let state_rx = self.state_tx.subscribe();

        let Self {
            socket_path,
            listener,
            backend,
            connection_timeout,
            state_tx,
        } = self;

        let task = tokio::spawn(async move {
            let result = serve(
                listener,
                &socket_path,
                backend,
                connection_timeout,
                shutdown_rx,
                &state_tx,
            )
            .await;

            let _ = std::fs::remove_file(&socket_path);
            state_tx.send_replace(ServerState::Stopped);

            if let Err(err) = result {
                let _ = failure_tx.send(err);
            }
        });

        PluginHandle {
            failure: failure_rx,
            shutdown: shutdown_tx,
            state: state_rx,
            task,
        }
    }
}

/// Lifecycle handle for a spawned [`PluginServer`].
pub struct PluginHandle {
    /// Fires at most once, with the error that killed the serve loop.
    pub failure: oneshot::Receiver<ServeError>,
    shutdown: watch::Sender<Option<ShutdownMode>>,
    state: watch::Receiver<ServerState>,
    task: JoinHandle<()>,
}

impl PluginHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Stops accepting, lets in-flight calls finish, waits for the loop.
    pub async fn shutdown_graceful(self) {
        self.shutdown_with(ShutdownMode::Graceful).await;
    }

    /// Tears down connections and in-flight calls without waiting.
    pub async fn shutdown_immediate(self) {
        self.shutdown_with(ShutdownMode::Immediate).await;
    }

    async fn shutdown_with(self, mode: ShutdownMode) {
        self.shutdown.send_replace(Some(mode));
        let _ = self.task.await;
    }
}

async fn serve<B: KmsBackend + 'static>(
    listener: UnixListener,
    socket_path: &std::path::Path,
    backend: Arc<B>,
    connection_timeout: Duration,
    mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    state_tx: &watch::Sender<ServerState>,
) -> Result<(), ServeError> {
    let mut connections = JoinSet::new();

    let mode = loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                match *shutdown_rx.borrow() {
                    Some(mode) => break mode,
                    // Handle dropped without a shutdown request: drain and stop.
                    None if changed.is_err() => break ShutdownMode::Graceful,
                    None => {},
                }
            },
            accepted = listener.accept() => {
                let (stream, _addr) = accepted.map_err(|source| ServeError::Accept {
                    path: socket_path.to_path_buf(),
                    source,
                })?;
                connections.spawn(handle_connection(
                    stream,
                    backend.clone(),
                    connection_timeout,
                    shutdown_rx.clone(),
                ));
            },
        }
    };

    drop(listener);
    match mode {
        ShutdownMode::Graceful => {
            state_tx.send_replace(ServerState::ShuttingDownGraceful);
            debug!("draining in-flight plugin calls");
            while connections.join_next().await.is_some() {}
        },
        ShutdownMode::Immediate => {
            state_tx.send_replace(ServerState::ShuttingDownImmediate);
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        },
    }

    Ok(())
}

/// Serves one connection until EOF, idle timeout, or shutdown.
///
/// A request already being handled when shutdown starts is answered before
/// the connection closes.
async fn handle_connection<B: KmsBackend>(
    stream: UnixStream,
    backend: Arc<B>,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    loop {
        if shutdown_rx.borrow_and_update().is_some() {
            break;
        }

        let request: PluginRequest = tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = tokio::time::timeout(idle_timeout, read_message(&mut reader)) => match read {
                Err(_) => {
                    debug!("closing idle plugin connection");
                    break;
                },
                Ok(Ok(None)) => break,
                Ok(Ok(Some(request))) => request,
                Ok(Err(err)) => {
                    warn!(error = %err, "rejecting malformed plugin request");
                    let _ = write_message(&mut writer, &PluginResponse::error(&err)).await;
                    break;
                },
            },
        };

        let response = handle_request(backend.as_ref(), request).await;
        if let Err(err) = write_message(&mut writer, &response).await {
            debug!(error = %err, "failed to write plugin response");
            break;
        }
    }
}

/// Translates one wire request into a backend call and back.
async fn handle_request<B: KmsBackend>(backend: &B, request: PluginRequest) -> PluginResponse {
    match request {
        PluginRequest::Status => match backend.status().await {
            Ok(status) => PluginResponse::Status {
                version: KMS_API_VERSION.to_string(),
                healthz: status.healthz,
                key_id: status.key_id,
            },
            Err(err) => PluginResponse::error(err),
        },
        PluginRequest::Encrypt { uid, plaintext } => {
            debug!(uid = %uid, "encrypt request");
            let plaintext = match decode_payload(&plaintext) {
                Ok(plaintext) => plaintext,
                Err(err) => return PluginResponse::error(err),
            };
            match backend.encrypt(&plaintext).await {
                Ok(encrypted) => PluginResponse::Encrypt {
                    ciphertext: encode_payload(&encrypted.ciphertext),
                    key_id: encrypted.key_id,
                    annotations: BTreeMap::new(),
                },
                Err(err) => PluginResponse::error(err),
            }
        },
        PluginRequest::Decrypt {
            uid,
            ciphertext,
            key_id,
            annotations: _,
        } => {
            debug!(uid = %uid, key_id = %key_id, "decrypt request");
            let ciphertext = match decode_payload(&ciphertext) {
                Ok(ciphertext) => ciphertext,
                Err(err) => return PluginResponse::error(err),
            };
            match backend.decrypt(&ciphertext, &key_id).await {
                Ok(plaintext) => PluginResponse::Decrypt {
                    plaintext: encode_payload(&plaintext),
                },
                Err(err) => PluginResponse::error(err),
            }
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
