//! Collaborator error types.

use thiserror::Error;

/// Failures reported by the rate limiter or notifier.
///
/// These never surface to ledger callers; the workflow logs them and
/// carries on.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Rate limiter error: {0}")]
    RateLimiter(String),

    #[error("Notification error: {0}")]
    Notifier(String),
}
