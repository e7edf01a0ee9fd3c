//! Backend capability error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while talking to the remote Egide server.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The extra CA certificate could not be loaded.
    #[error("failed to load CA certificate {path}: {reason}")]
    CaCertificate {
        /// Path of the PEM file.
        path: PathBuf,
        /// What went wrong reading or parsing it.
        reason: String,
    },

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// The request never produced a usable HTTP response.
    #[error("{operation} request failed: {source}")]
    Request {
        /// Which backend operation was attempted.
        operation: &'static str,
        /// Underlying transport error.
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("{operation} rejected by server: {message}")]
    Api {
        /// Which backend operation was attempted.
        operation: &'static str,
        /// Error text from the server's error body.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("failed to parse {operation} response: {source}")]
    Response {
        /// Which backend operation was attempted.
        operation: &'static str,
        /// Underlying decode error.
        source: reqwest::Error,
    },

    /// A payload field from the server was malformed.
    #[error("invalid payload from server: {0}")]
    Payload(String),

    /// The service account keyfile could not be read.
    #[error("failed to read service account keyfile {path}: {source}")]
    Keyfile {
        /// Path of the keyfile.
        path: PathBuf,
        /// Underlying read error.
        source: io::Error,
    },

    /// A KMS call was issued before any login succeeded.
    #[error("not logged in")]
    NotLoggedIn,
}
