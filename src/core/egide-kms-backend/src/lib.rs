//! # Egide KMS Backend
//!
//! The backend capability consumed by the KMS plugin: machine identity login
//! plus key wrap/unwrap against a remote Egide server.
//!
//! Two seams are exposed as traits so the serving layers can be exercised
//! without a live server:
//!
//! - [`KmsBackend`] - `status` / `encrypt` / `decrypt`
//! - [`MachineIdentityAuth`] - one login operation per credential strategy
//!
//! [`EgideClient`] implements both over the Egide HTTP API. Its session token
//! is written exactly once, by the login that wins credential resolution, and
//! only read afterwards; concurrent calls need no further coordination.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

pub use error::BackendError;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Fixed payload encrypted by the default status probe.
///
/// Status is a real round-trip exercise of the current key, not a no-op, so
/// an "ok" certifies both reachability and the key's usability.
const STATUS_PROBE_PAYLOAD: &[u8] = b"egide-kms-status-probe";

// ============================================================================
// Capability Traits
// ============================================================================

/// Health verdict for the backend and its active key.
#[derive(Debug, Clone)]
pub struct KmsStatus {
    /// `"ok"` when the probe round-trip succeeded.
    pub healthz: String,
    /// The key id currently used for encryption.
    pub key_id: String,
}

/// A wrapped key as returned by [`KmsBackend::encrypt`].
#[derive(Debug, Clone)]
pub struct EncryptedDek {
    /// Opaque ciphertext.
    pub ciphertext: Vec<u8>,
    /// Identifier of the key that produced the ciphertext.
    pub key_id: String,
}

/// Key wrap/unwrap operations against the remote KMS.
#[async_trait]
pub trait KmsBackend: Send + Sync {
    /// Wraps `plaintext` with the configured key.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedDek, BackendError>;

    /// Unwraps `ciphertext` with the key identified by `key_id`.
    async fn decrypt(&self, ciphertext: &[u8], key_id: &str) -> Result<Vec<u8>, BackendError>;

    /// Probes the backend by encrypting a small fixed payload.
    async fn status(&self) -> Result<KmsStatus, BackendError> {
        let encrypted = self.encrypt(STATUS_PROBE_PAYLOAD).await?;
        Ok(KmsStatus {
            healthz: "ok".to_string(),
            key_id: encrypted.key_id,
        })
    }
}

/// One login operation per supported machine identity strategy.
///
/// Applicability checks stay with the credential resolver; each method here
/// performs the actual remote login and stores the resulting session.
#[async_trait]
pub trait MachineIdentityAuth: Send + Sync {
    /// Universal auth: explicit client id and secret.
    async fn login_universal(&self, client_id: &str, client_secret: &str)
        -> Result<(), BackendError>;

    /// AWS IAM machine identity.
    async fn login_aws_iam(&self, identity_id: &str) -> Result<(), BackendError>;

    /// Azure machine identity. An empty `resource` means the server default.
    async fn login_azure(&self, identity_id: &str, resource: &str) -> Result<(), BackendError>;

    /// GCP ID token machine identity.
    async fn login_gcp_id_token(&self, identity_id: &str) -> Result<(), BackendError>;

    /// GCP IAM machine identity backed by a service account keyfile.
    async fn login_gcp_iam(
        &self,
        identity_id: &str,
        service_account_keyfile_path: &str,
    ) -> Result<(), BackendError>;
}

// ============================================================================
// HTTP API Types
// ============================================================================

#[derive(Serialize)]
struct UniversalLoginRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Serialize)]
struct IdentityLoginRequest<'a> {
    identity_id: &'a str,
}

#[derive(Serialize)]
struct AzureLoginRequest<'a> {
    identity_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<&'a str>,
}

#[derive(Serialize)]
struct GcpIamLoginRequest<'a> {
    identity_id: &'a str,
    service_account_key: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    expires_in: u64,
}

#[derive(Serialize)]
struct KmsEncryptRequest<'a> {
    plaintext: &'a str,
}

#[derive(Deserialize)]
struct KmsEncryptResponse {
    ciphertext: String,
    key_id: String,
}

#[derive(Serialize)]
struct KmsDecryptRequest<'a> {
    ciphertext: &'a str,
}

#[derive(Deserialize)]
struct KmsDecryptResponse {
    plaintext: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Egide Client
// ============================================================================

/// Configuration for [`EgideClient`].
#[derive(Debug, Clone)]
pub struct EgideClientConfig {
    /// Base URL of the Egide server, e.g. `http://localhost:8200`.
    pub base_url: String,
    /// Optional extra CA certificate (PEM) added to the trust store.
    pub ca_certificate: Option<PathBuf>,
    /// Identifier of the KMS key used for encryption.
    pub kms_key_id: String,
}

/// HTTP client for the Egide server's auth and KMS APIs.
pub struct EgideClient {
    client: reqwest::Client,
    base_url: String,
    kms_key_id: String,
    token: RwLock<Option<String>>,
}

impl EgideClient {
    /// Builds a client. No network traffic happens until a login is issued.
    pub fn new(config: EgideClientConfig) -> Result<Self, BackendError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));

        if let Some(path) = &config.ca_certificate {
            let pem = std::fs::read(path).map_err(|e| BackendError::CaCertificate {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let cert =
                reqwest::Certificate::from_pem(&pem).map_err(|e| BackendError::CaCertificate {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            kms_key_id: config.kms_key_id,
            token: RwLock::new(None),
        })
    }

    /// The key id this client encrypts with.
    pub fn key_id(&self) -> &str {
        &self.kms_key_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn bearer_token(&self) -> Result<String, BackendError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or(BackendError::NotLoggedIn)
    }

    /// POSTs a login body to `/v1/auth/<method>/login` and stores the session.
    async fn login_request<B: Serialize>(
        &self,
        operation: &'static str,
        method: &str,
        body: &B,
    ) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(self.url(&format!("/v1/auth/{}/login", method)))
            .json(body)
            .send()
            .await
            .map_err(|source| BackendError::Request { operation, source })?;

        if !resp.status().is_success() {
            let error: ErrorResponse = resp.json().await.unwrap_or(ErrorResponse {
                error: "unknown error".into(),
            });
            return Err(BackendError::Api {
                operation,
                message: error.error,
            });
        }

        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|source| BackendError::Response { operation, source })?;

        *self.token.write().await = Some(login.access_token);
        debug!(method, "machine identity login succeeded");
        Ok(())
    }
}

#[async_trait]
impl MachineIdentityAuth for EgideClient {
    async fn login_universal(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<(), BackendError> {
        let body = UniversalLoginRequest {
            client_id,
            client_secret,
        };
        self.login_request("universal auth login", "universal", &body)
            .await
    }

    async fn login_aws_iam(&self, identity_id: &str) -> Result<(), BackendError> {
        let body = IdentityLoginRequest { identity_id };
        self.login_request("AWS IAM login", "aws-iam", &body).await
    }

    async fn login_azure(&self, identity_id: &str, resource: &str) -> Result<(), BackendError> {
        let body = AzureLoginRequest {
            identity_id,
            resource: if resource.is_empty() {
                None
            } else {
                Some(resource)
            },
        };
        self.login_request("Azure login", "azure", &body).await
    }

    async fn login_gcp_id_token(&self, identity_id: &str) -> Result<(), BackendError> {
        let body = IdentityLoginRequest { identity_id };
        self.login_request("GCP ID token login", "gcp-id-token", &body)
            .await
    }

    async fn login_gcp_iam(
        &self,
        identity_id: &str,
        service_account_keyfile_path: &str,
    ) -> Result<(), BackendError> {
        let path = PathBuf::from(service_account_keyfile_path);
        let service_account_key =
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| BackendError::Keyfile {
                    path: path.clone(),
                    source,
                })?;
        let body = GcpIamLoginRequest {
            identity_id,
            service_account_key,
        };
        self.login_request("GCP IAM login", "gcp-iam", &body).await
    }
}

#[async_trait]
impl KmsBackend for EgideClient {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedDek, BackendError> {
        let operation = "kms encrypt";
        let token = self.bearer_token().await?;
        let encoded = BASE64.encode(plaintext);
        let body = KmsEncryptRequest {
            plaintext: &encoded,
        };

        let resp = self
            .client
            .post(self.url(&format!("/v1/kms/keys/{}/encrypt", self.kms_key_id)))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|source| BackendError::Request { operation, source })?;

        if !resp.status().is_success() {
            let error: ErrorResponse = resp.json().await.unwrap_or(ErrorResponse {
                error: "unknown error".into(),
            });
            return Err(BackendError::Api {
                operation,
                message: error.error,
            });
        }

        let parsed: KmsEncryptResponse = resp
            .json()
            .await
            .map_err(|source| BackendError::Response { operation, source })?;

        // The ciphertext is an opaque token from the server; the plugin hands
        // its raw bytes to the control plane unchanged.
        Ok(EncryptedDek {
            ciphertext: parsed.ciphertext.into_bytes(),
            key_id: parsed.key_id,
        })
    }

    async fn decrypt(&self, ciphertext: &[u8], key_id: &str) -> Result<Vec<u8>, BackendError> {
        let operation = "kms decrypt";
        let token = self.bearer_token().await?;
        let ciphertext = std::str::from_utf8(ciphertext)
            .map_err(|e| BackendError::Payload(format!("ciphertext is not valid UTF-8: {}", e)))?;
        let body = KmsDecryptRequest { ciphertext };

        let resp = self
            .client
            .post(self.url(&format!("/v1/kms/keys/{}/decrypt", key_id)))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|source| BackendError::Request { operation, source })?;

        if !resp.status().is_success() {
            let error: ErrorResponse = resp.json().await.unwrap_or(ErrorResponse {
                error: "unknown error".into(),
            });
            return Err(BackendError::Api {
                operation,
                message: error.error,
            });
        }

        let parsed: KmsDecryptResponse = resp
            .json()
            .await
            .map_err(|source| BackendError::Response { operation, source })?;

        BASE64
            .decode(&parsed.plaintext)
            .map_err(|e| BackendError::Payload(format!("plaintext is not valid base64: {}", e)))
    }
}

// ============================================================================
// Tests
// ============================================================================
