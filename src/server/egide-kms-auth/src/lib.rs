//! # Egide KMS Auth
//!
//! Machine identity resolution for the KMS plugin.
//!
//! A deployment supplies one [`CredentialBundle`] at startup. Resolution walks
//! [`RESOLUTION_ORDER`] - a fixed, documented precedence - and attempts the
//! first strategy whose credential fields are populated. Exactly one login
//! call reaches the backend per process start: the chosen strategy either
//! authenticates or fails resolution outright; later strategies are never
//! used as fallback.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

pub use error::AuthError;

use tracing::info;

use egide_kms_backend::MachineIdentityAuth;

// ============================================================================
// Types
// ============================================================================

/// Credential material supplied once at process start.
///
/// Empty strings mean "not configured". The bundle is never mutated after
/// construction.
#[derive(Debug, Clone, Default)]
pub struct CredentialBundle {
    /// Universal auth client id.
    pub client_id: String,
    /// Universal auth client secret.
    pub client_secret: String,
    /// Machine identity id shared by the cloud identity strategies.
    pub identity_id: String,
    /// Azure resource; empty means the backend default.
    pub azure_resource: String,
    /// Path to a GCP service account keyfile.
    pub service_account_keyfile_path: String,
}

/// One supported way of proving machine identity to the backend.
///
/// `ServiceToken` and `ServiceAccount` are reserved legacy identifiers kept
/// for backward-compatible identification; they have no resolution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthStrategy {
    /// Legacy service token identifier (not resolvable).
    ServiceToken,
    /// Legacy service account identifier (not resolvable).
    ServiceAccount,
    /// Universal auth with explicit client credentials.
    Universal,
    /// AWS IAM machine identity.
    AwsIam,
    /// Azure machine identity.
    Azure,
    /// GCP ID token machine identity.
    GcpIdToken,
    /// GCP IAM machine identity with a service account keyfile.
    GcpIam,
}

impl std::fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::ServiceToken => "SERVICE_TOKEN",
            Self::ServiceAccount => "SERVICE_ACCOUNT",
            Self::Universal => "UNIVERSAL_MACHINE_IDENTITY",
            Self::AwsIam => "AWS_IAM_MACHINE_IDENTITY",
            Self::Azure => "AZURE_MACHINE_IDENTITY",
            Self::GcpIdToken => "GCP_ID_TOKEN_MACHINE_IDENTITY",
            Self::GcpIam => "GCP_IAM_MACHINE_IDENTITY",
        };
        f.write_str(tag)
    }
}

impl AuthStrategy {
    /// Whether the bundle carries enough material to attempt this strategy.
    ///
    /// Pure; performs no I/O. Several strategies share `identity_id`, so more
    /// than one can be applicable at once - [`RESOLUTION_ORDER`] breaks the
    /// tie.
    pub fn applicable(self, bundle: &CredentialBundle) -> bool {
        match self {
            Self::Universal => !bundle.client_id.is_empty() && !bundle.client_secret.is_empty(),
            Self::AwsIam | Self::Azure | Self::GcpIdToken => !bundle.identity_id.is_empty(),
            Self::GcpIam => {
                !bundle.identity_id.is_empty()
                    && !bundle.service_account_keyfile_path.is_empty()
            },
            Self::ServiceToken | Self::ServiceAccount => false,
        }
    }
}

/// Fixed precedence for resolution.
///
/// This order is a documented contract: when several strategies are
/// configured at once (e.g. a leftover identity id next to explicit client
/// credentials), the earliest applicable entry wins, on every run.
pub const RESOLUTION_ORDER: [AuthStrategy; 5] = [
    AuthStrategy::Universal,
    AuthStrategy::AwsIam,
    AuthStrategy::Azure,
    AuthStrategy::GcpIdToken,
    AuthStrategy::GcpIam,
];

/// The strategy that successfully authenticated.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedAuth {
    /// Tag of the winning strategy.
    pub strategy: AuthStrategy,
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolves the bundle to exactly one authenticated session.
///
/// Walks [`RESOLUTION_ORDER`]; the first applicable strategy performs its
/// login and resolution terminates either way. No applicable strategy at all
/// yields [`AuthError::NoValidAuth`] without any backend traffic.
pub async fn resolve<A>(bundle: &CredentialBundle, auth: &A) -> Result<ResolvedAuth, AuthError>
where
    A: MachineIdentityAuth + ?Sized,
{
    for strategy in RESOLUTION_ORDER {
        if !strategy.applicable(bundle) {
            continue;
        }

        let login = match strategy {
            AuthStrategy::Universal => {
                auth.login_universal(&bundle.client_id, &bundle.client_secret)
                    .await
            },
            AuthStrategy::AwsIam => auth.login_aws_iam(&bundle.identity_id).await,
            AuthStrategy::Azure => {
                auth.login_azure(&bundle.identity_id, &bundle.azure_resource)
                    .await
            },
            AuthStrategy::GcpIdToken => auth.login_gcp_id_token(&bundle.identity_id).await,
            AuthStrategy::GcpIam => {
                auth.login_gcp_iam(
                    &bundle.identity_id,
                    &bundle.service_account_keyfile_path,
                )
                .await
            },
            // Legacy tags never pass the applicability check.
            AuthStrategy::ServiceToken | AuthStrategy::ServiceAccount => continue,
        };

        return match login {
            Ok(()) => {
                info!(strategy = %strategy, "using auth method");
                Ok(ResolvedAuth { strategy })
            },
            Err(source) => Err(AuthError::Strategy { strategy, source }),
        };
    }

    Err(AuthError::NoValidAuth)
}

// ============================================================================
// Tests
// ============================================================================
