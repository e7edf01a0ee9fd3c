//! Wire protocol error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur on the plugin wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Connecting to the plugin socket failed.
    #[error("failed to connect to plugin socket {path}: {source}")]
    Connect {
        /// Socket path the connection was attempted against.
        path: PathBuf,
        /// Underlying connect error.
        source: io::Error,
    },

    /// Socket I/O failed mid-conversation.
    #[error("socket i/o failed: {0}")]
    Io(#[from] io::Error),

    /// A message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),

    /// A received line was not a valid message.
    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),

    /// A payload field was not valid base64.
    #[error("invalid payload encoding: {0}")]
    Payload(base64::DecodeError),

    /// The peer closed the connection before responding.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The server reported a call-level error.
    #[error("{0}")]
    Call(String),

    /// The server answered with a response of the wrong kind.
    #[error("unexpected response type")]
    UnexpectedResponse,
}
