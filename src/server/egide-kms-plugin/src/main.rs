//! Egide KMS plugin - data-at-rest encryption provider for Kubernetes,
//! backed by a remote Egide server.

mod error;
mod healthz;
mod server;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use egide_kms_auth::{resolve, CredentialBundle};
use egide_kms_backend::{EgideClient, EgideClientConfig};

use crate::healthz::HealthCheck;
use crate::server::PluginServer;
use crate::supervisor::ShutdownReason;

/// How long an idle plugin connection stays open.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Parser)]
#[command(name = "egide-kms-plugin")]
#[command(about = "Egide KMS provider plugin - Kubernetes data-at-rest encryption")]
#[command(version)]
struct Cli {
    /// Egide server address
    #[arg(long, default_value = "http://localhost:8200", env = "EGIDE_ADDR")]
    host_url: String,

    /// Extra CA certificate for SSL/TLS (PEM)
    #[arg(long, env = "EGIDE_CA_CERTIFICATE")]
    ca_certificate: Option<PathBuf>,

    /// Plugin socket path the control plane connects to
    #[arg(long, default_value = "/opt/egidekms.socket", env = "EGIDE_KMS_LISTEN_ADDR")]
    listen_addr: PathBuf,

    /// Egide KMS key ID
    #[arg(long, default_value = "", env = "EGIDE_KMS_KEY")]
    kms_key: String,

    /// Machine identity ID
    #[arg(long, default_value = "", env = "EGIDE_IDENTITY_ID")]
    identity_id: String,

    /// Universal auth client ID
    #[arg(long, default_value = "", env = "EGIDE_UA_CLIENT_ID")]
    ua_client_id: String,

    /// Universal auth client secret
    #[arg(long, default_value = "", env = "EGIDE_UA_CLIENT_SECRET")]
    ua_client_secret: String,

    /// Azure resource
    #[arg(long, default_value = "", env = "EGIDE_AZURE_RESOURCE")]
    azure_resource: String,

    /// Path of the service account keyfile
    #[arg(long, default_value = "", env = "EGIDE_SERVICE_ACCOUNT_KEYFILE_PATH")]
    service_account_keyfile_path: String,

    /// Port for the health check endpoint
    #[arg(long, default_value = "8787", env = "EGIDE_HEALTHZ_PORT")]
    healthz_port: u16,

    /// Path for the health check endpoint
    #[arg(long, default_value = "/healthz", env = "EGIDE_HEALTHZ_PATH")]
    healthz_path: String,

    /// Probe timeout for the health check, in seconds
    #[arg(long, default_value = "20", env = "EGIDE_HEALTHZ_TIMEOUT_SECS")]
    healthz_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.kms_key.is_empty() {
        bail!("KMS key ID is missing");
    }
    if !cli.healthz_path.starts_with('/') {
        bail!("health check path must start with '/'");
    }

    let client = EgideClient::new(EgideClientConfig {
        base_url: cli.host_url.clone(),
        ca_certificate: cli.ca_certificate.clone(),
        kms_key_id: cli.kms_key.clone(),
    })
    .context("failed to build Egide client")?;

    // Authenticate before anything is listening; a rejected or missing
    // credential must never leave a half-started plugin behind.
    let bundle = CredentialBundle {
        client_id: cli.ua_client_id.clone(),
        client_secret: cli.ua_client_secret.clone(),
        identity_id: cli.identity_id.clone(),
        azure_resource: cli.azure_resource.clone(),
        service_account_keyfile_path: cli.service_account_keyfile_path.clone(),
    };
    resolve(&bundle, &client)
        .await
        .context("error authenticating with Egide")?;

    let backend = Arc::new(client);

    let mut plugin = PluginServer::bind(cli.listen_addr.clone(), backend, CONNECTION_TIMEOUT)
        .context("failed to start plugin server")?
        .spawn();

    let mut health = HealthCheck::new(
        cli.healthz_path.clone(),
        cli.healthz_port,
        Duration::from_secs(cli.healthz_timeout_secs),
        cli.listen_addr.clone(),
    )
    .start()
    .await
    .context("failed to start health check server")?;

    let reason = supervisor::wait_for_shutdown(&mut plugin.failure, &mut health.failure).await?;
    tracing::info!(%reason, "shutting down plugin");

    // In-flight control plane calls finish before the process exits; the
    // health listener is closed on every exit path as well.
    plugin.shutdown_graceful().await;
    health.shutdown().await;

    match reason {
        ShutdownReason::Signal(_) => Ok(()),
        ShutdownReason::Plugin(err) => Err(err).context("plugin server failed"),
        ShutdownReason::Health(err) => Err(err).context("health check server failed"),
    }
}
