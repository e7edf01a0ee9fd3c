//! Serving errors fatal to one of the two servers.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// A structural serving failure.
///
/// These are distinct from call-level errors: a call-level error is answered
/// on the wire and the server keeps going, while a `ServeError` terminates
/// the owning server and reaches the supervisor as a shutdown trigger.
#[derive(Debug, Error)]
pub enum ServeError {
    /// A stale socket file existed and could not be removed.
    #[error("failed to remove stale socket file {path}: {source}")]
    RemoveStaleSocket {
        /// The configured socket path.
        path: PathBuf,
        /// Underlying filesystem error.
        source: io::Error,
    },

    /// Binding the plugin socket failed.
    #[error("failed to bind plugin socket {path}: {source}")]
    Bind {
        /// The configured socket path.
        path: PathBuf,
        /// Underlying bind error.
        source: io::Error,
    },

    /// The accept loop failed.
    #[error("accept failed on plugin socket {path}: {source}")]
    Accept {
        /// The configured socket path.
        path: PathBuf,
        /// Underlying accept error.
        source: io::Error,
    },

    /// Binding the health endpoint failed.
    #[error("failed to bind health endpoint {addr}: {source}")]
    BindHealth {
        /// The configured bind address.
        addr: SocketAddr,
        /// Underlying bind error.
        source: io::Error,
    },

    /// The health endpoint's serve loop terminated.
    #[error("health endpoint terminated: {0}")]
    Health(io::Error),

    /// A server task ended without reporting anything.
    #[error("server task stopped unexpectedly")]
    Stopped,
}
