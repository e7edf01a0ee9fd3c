//! Integration test harness for the Egide KMS plugin.
//!
//! Provides a mock Egide server (auth + KMS HTTP API) and a helper that
//! spawns the real plugin binary against it.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use egide_kms_api::PluginClient;

/// Bearer token issued by the mock server on every successful login.
pub const MOCK_TOKEN: &str = "mock-access-token";

// ============================================================================
// Mock Egide Server
// ============================================================================

struct MockState {
    client_id: String,
    client_secret: String,
    key_id: String,
    logins: Mutex<Vec<String>>,
}

/// An in-process Egide server good enough for the plugin to talk to.
pub struct MockEgide {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockEgide {
    /// Starts the mock on an ephemeral port.
    ///
    /// `client_id`/`client_secret` are the only accepted universal auth
    /// credentials; identity-based logins accept any non-empty identity id.
    pub async fn start(client_id: &str, client_secret: &str, key_id: &str) -> Result<Self> {
        let state = Arc::new(MockState {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            key_id: key_id.to_string(),
            logins: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/v1/auth/{method}/login", post(handle_login))
            .route("/v1/kms/keys/{key_id}/encrypt", post(handle_encrypt))
            .route("/v1/kms/keys/{key_id}/decrypt", post(handle_decrypt))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock server")?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    /// Base URL for the plugin's `--host-url` flag.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Which login endpoints were hit, in order.
    pub fn logins(&self) -> Vec<String> {
        self.state.logins.lock().unwrap().clone()
    }

    /// Stops the mock server.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", MOCK_TOKEN))
        .unwrap_or(false)
}

async fn handle_login(
    State(state): State<Arc<MockState>>,
    Path(method): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    state.logins.lock().unwrap().push(method.clone());

    let accepted = if method == "universal" {
        body["client_id"] == json!(state.client_id)
            && body["client_secret"] == json!(state.client_secret)
    } else {
        body["identity_id"]
            .as_str()
            .map(|id| !id.is_empty())
            .unwrap_or(false)
    };

    if !accepted {
        return error_body(StatusCode::UNAUTHORIZED, "login rejected");
    }

    Json(json!({ "access_token": MOCK_TOKEN, "expires_in": 3600 })).into_response()
}

async fn handle_encrypt(
    State(state): State<Arc<MockState>>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return error_body(StatusCode::UNAUTHORIZED, "missing or invalid token");
    }
    if key_id != state.key_id {
        return error_body(StatusCode::NOT_FOUND, "key not found");
    }
    let Some(plaintext) = body["plaintext"].as_str() else {
        return error_body(StatusCode::BAD_REQUEST, "missing plaintext");
    };

    Json(json!({
        "ciphertext": format!("egide:v1:{}", plaintext),
        "key_id": key_id,
    }))
    .into_response()
}

async fn handle_decrypt(
    State(state): State<Arc<MockState>>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return error_body(StatusCode::UNAUTHORIZED, "missing or invalid token");
    }
    if key_id != state.key_id {
        return error_body(StatusCode::NOT_FOUND, "key not found");
    }
    let Some(ciphertext) = body["ciphertext"].as_str() else {
        return error_body(StatusCode::BAD_REQUEST, "missing ciphertext");
    };
    let Some(plaintext) = ciphertext.strip_prefix("egide:v1:") else {
        return error_body(StatusCode::BAD_REQUEST, "malformed ciphertext");
    };

    Json(json!({ "plaintext": plaintext })).into_response()
}

// ============================================================================
// Test Plugin Process
// ============================================================================

/// A plugin process under test, with its own socket directory.
pub struct TestPlugin {
    process: Child,
    /// Socket path the plugin listens on.
    pub socket_path: PathBuf,
    /// Health endpoint port.
    pub healthz_port: u16,
    _dir: TempDir,
}

impl TestPlugin {
    /// Spawns the plugin binary against `base_url` and waits for its socket.
    ///
    /// `extra_args` supplies the credential flags, e.g.
    /// `&["--ua-client-id", "client-1"]`.
    pub async fn start(base_url: &str, healthz_port: u16, extra_args: &[&str]) -> Result<Self> {
        let dir = TempDir::new().context("failed to create temp dir")?;
        let socket_path = dir.path().join("plugin.sock");
        let binary = find_plugin_binary()?;

        let process = base_command(&binary, base_url, &socket_path, healthz_port)
            .args(extra_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start plugin: {:?}", binary))?;

        let plugin = Self {
            process,
            socket_path,
            healthz_port,
            _dir: dir,
        };
        plugin.wait_for_socket().await?;

        Ok(plugin)
    }

    /// Runs the plugin binary to completion (for startup-failure cases).
    pub fn run_to_exit(base_url: &str, healthz_port: u16, extra_args: &[&str]) -> Result<Output> {
        let dir = TempDir::new().context("failed to create temp dir")?;
        let socket_path = dir.path().join("plugin.sock");
        let binary = find_plugin_binary()?;

        base_command(&binary, base_url, &socket_path, healthz_port)
            .args(extra_args)
            .output()
            .context("failed to run plugin binary")
    }

    /// Waits until the plugin socket accepts connections.
    async fn wait_for_socket(&self) -> Result<()> {
        for _ in 0..50 {
            if PluginClient::connect(&self.socket_path).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        bail!("plugin failed to start listening within 5 seconds")
    }

    /// URL of the plugin's health endpoint.
    pub fn healthz_url(&self) -> String {
        format!("http://127.0.0.1:{}/healthz", self.healthz_port)
    }

    /// Opens a fresh client connection to the plugin socket.
    pub async fn client(&self) -> Result<PluginClient> {
        Ok(PluginClient::connect(&self.socket_path).await?)
    }

    /// Sends SIGTERM to the plugin process.
    pub fn terminate(&self) -> Result<()> {
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(self.process.id().to_string())
            .status()
            .context("failed to run kill")?;
        if !status.success() {
            bail!("kill -TERM failed: {}", status);
        }
        Ok(())
    }

    /// Waits for the process to exit, polling for up to 10 seconds.
    pub async fn wait_for_exit(&mut self) -> Result<ExitStatus> {
        for _ in 0..100 {
            if let Some(status) = self.process.try_wait()? {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        bail!("plugin did not exit within 10 seconds")
    }
}

impl Drop for TestPlugin {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

fn base_command(
    binary: &std::path::Path,
    base_url: &str,
    socket_path: &std::path::Path,
    healthz_port: u16,
) -> Command {
    let mut command = Command::new(binary);
    command
        .arg("--host-url")
        .arg(base_url)
        .arg("--listen-addr")
        .arg(socket_path)
        .arg("--kms-key")
        .arg("test-key")
        .arg("--healthz-port")
        .arg(healthz_port.to_string());
    command
}

/// Find the plugin binary in the target directory.
fn find_plugin_binary() -> Result<PathBuf> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());

    // Try debug build first, then release
    let candidates = [
        std::path::Path::new(&manifest_dir).join("../../target/debug/egide-kms-plugin"),
        std::path::Path::new(&manifest_dir).join("../../target/release/egide-kms-plugin"),
    ];

    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.canonicalize()?);
        }
    }

    bail!(
        "Could not find egide-kms-plugin binary. Run 'cargo build -p egide-kms-plugin' first. Searched in: {:?}",
        candidates
    )
}
