//! # Egide KMS Plugin API
//!
//! The fixed wire contract between the orchestration control plane and the
//! Egide KMS plugin: three operations (status, encrypt, decrypt) served over
//! a unix socket.
//!
//! ## Framing
//!
//! One JSON message per line, newline-terminated. Requests are tagged with an
//! `op` field, responses with a `result` field. Payload bytes (plaintext and
//! ciphertext) travel base64-encoded.
//!
//! The message shapes are externally defined and must not change; this crate
//! only gives them a Rust spelling.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

pub use error::ProtocolError;

use std::collections::BTreeMap;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixStream,
};

/// Protocol version reported by status responses.
pub const KMS_API_VERSION: &str = "v2";

// ============================================================================
// Messages
// ============================================================================

/// A request from the control plane to the plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PluginRequest {
    /// Probe the plugin and the backend behind it.
    Status,
    /// Wrap a storage encryption key.
    Encrypt {
        /// Request id assigned by the control plane, for log correlation.
        uid: String,
        /// Base64-encoded plaintext.
        plaintext: String,
    },
    /// Unwrap a storage encryption key.
    Decrypt {
        /// Request id assigned by the control plane, for log correlation.
        uid: String,
        /// Base64-encoded ciphertext.
        ciphertext: String,
        /// Identifier of the key the ciphertext was produced with.
        key_id: String,
        /// Opaque annotations stored alongside the ciphertext.
        #[serde(default)]
        annotations: BTreeMap<String, String>,
    },
}

/// A response from the plugin to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PluginResponse {
    /// Answer to [`PluginRequest::Status`].
    Status {
        /// Protocol version, always [`KMS_API_VERSION`].
        version: String,
        /// `"ok"` when the backend round-trip succeeded.
        healthz: String,
        /// The key id currently used for encryption.
        key_id: String,
    },
    /// Answer to [`PluginRequest::Encrypt`].
    Encrypt {
        /// Base64-encoded ciphertext.
        ciphertext: String,
        /// Identifier of the key used.
        key_id: String,
        /// Annotations to store alongside the ciphertext (currently empty).
        annotations: BTreeMap<String, String>,
    },
    /// Answer to [`PluginRequest::Decrypt`].
    Decrypt {
        /// Base64-encoded plaintext.
        plaintext: String,
    },
    /// Call-level failure. The connection stays usable.
    Error {
        /// Error text, surfaced verbatim from the failing layer.
        message: String,
    },
}

impl PluginResponse {
    /// Builds an error response from any displayable error.
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

/// Status fields, as returned by [`PluginClient::status`].
#[derive(Debug, Clone)]
pub struct StatusInfo {
    /// Protocol version.
    pub version: String,
    /// Health verdict, `"ok"` when usable.
    pub healthz: String,
    /// The key id currently used for encryption.
    pub key_id: String,
}

/// Result of an encrypt call, as returned by [`PluginClient::encrypt`].
#[derive(Debug, Clone)]
pub struct EncryptResult {
    /// Opaque ciphertext.
    pub ciphertext: Vec<u8>,
    /// Identifier of the key used.
    pub key_id: String,
    /// Annotations to store alongside the ciphertext.
    pub annotations: BTreeMap<String, String>,
}

// ============================================================================
// Payload Encoding
// ============================================================================

/// Encodes payload bytes for transport.
pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decodes a base64 payload field.
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64.decode(encoded).map_err(ProtocolError::Payload)
}

// ============================================================================
// Framing
// ============================================================================

/// Writes one message as a single JSON line.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one JSON-line message. Returns `None` on a clean EOF.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line.trim_end()).map_err(ProtocolError::Decode)?;
    Ok(Some(message))
}

// ============================================================================
// Client
// ============================================================================

/// A client connection to the plugin socket.
///
/// Opens one unix-socket connection and issues calls over it. The health
/// prober opens a fresh client per probe; nothing here pools or caches.
pub struct PluginClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl PluginClient {
    /// Connects to the plugin socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ProtocolError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Issues one request and reads one response.
    pub async fn call(&mut self, request: &PluginRequest) -> Result<PluginResponse, ProtocolError> {
        write_message(&mut self.writer, request).await?;
        read_message(&mut self.reader)
            .await?
            .ok_or(ProtocolError::ConnectionClosed)
    }

    /// Issues a status call.
    pub async fn status(&mut self) -> Result<StatusInfo, ProtocolError> {
        match self.call(&PluginRequest::Status).await? {
            PluginResponse::Status {
                version,
                healthz,
                key_id,
            } => Ok(StatusInfo {
                version,
                healthz,
                key_id,
            }),
            PluginResponse::Error { message } => Err(ProtocolError::Call(message)),
            _ => Err(ProtocolError::UnexpectedResponse),
        }
    }

    /// Issues an encrypt call for `plaintext`.
    pub async fn encrypt(&mut self, uid: &str, plaintext: &[u8]) -> Result<EncryptResult, ProtocolError> {
        let request = PluginRequest::Encrypt {
            uid: uid.to_string(),
            plaintext: encode_payload(plaintext),
        };
        match self.call(&request).await? {
            PluginResponse::Encrypt {
                ciphertext,
                key_id,
                annotations,
            } => Ok(EncryptResult {
                ciphertext: decode_payload(&ciphertext)?,
                key_id,
                annotations,
            }),
            PluginResponse::Error { message } => Err(ProtocolError::Call(message)),
            _ => Err(ProtocolError::UnexpectedResponse),
        }
    }

    /// Issues a decrypt call for `ciphertext` produced with `key_id`.
    pub async fn decrypt(
        &mut self,
        uid: &str,
        ciphertext: &[u8],
        key_id: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<Vec<u8>, ProtocolError> {
        let request = PluginRequest::Decrypt {
            uid: uid.to_string(),
            ciphertext: encode_payload(ciphertext),
            key_id: key_id.to_string(),
            annotations,
        };
        match self.call(&request).await? {
            PluginResponse::Decrypt { plaintext } => decode_payload(&plaintext),
            PluginResponse::Error { message } => Err(ProtocolError::Call(message)),
            _ => Err(ProtocolError::UnexpectedResponse),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
