//! Error taxonomy for provider calls.
//!
//! The reconcile loop keys its retry behavior off these variants:
//! transient failures are retried with per-instance backoff, permanent
//! failures abandon the instance entry, and `NotFound` on terminate is an
//! idempotent no-op.

use thiserror::Error;

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors returned by a compute provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network errors, timeouts, throttling — safe to retry with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Quota exceeded, invalid launch spec, rejected request — retrying
    /// will not help.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The provider has no such instance.
    #[error("instance not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    /// Whether the call may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Whether the provider reported the instance missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}
