//! Authentication error types.

use thiserror::Error;

use egide_kms_backend::BackendError;

use crate::AuthStrategy;

/// Errors that can occur during credential resolution.
///
/// A strategy whose required fields are absent is not an error; it is skipped
/// silently. Errors surface only when a configured strategy's login is
/// rejected, or when nothing is configured at all.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The chosen strategy's login was rejected by the backend.
    #[error("authentication failed for strategy {strategy}: {source}")]
    Strategy {
        /// The strategy that was applicable and attempted.
        strategy: AuthStrategy,
        /// The backend's rejection.
        source: BackendError,
    },

    /// No strategy had enough credential material to attempt a login.
    #[error("no valid authentication configured")]
    NoValidAuth,
}
