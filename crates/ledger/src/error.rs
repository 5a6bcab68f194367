//! Ledger error types.

use common::{EventId, TicketId, UserId};
use ledger_store::{Retryable, StoreError};
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ticket, token, event, transfer, or fulfillment does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The ticket has no admissions left, or was already used where an
    /// unused ticket is required.
    #[error("Ticket {0} is already used")]
    AlreadyUsed(TicketId),

    /// The owner has no admissions left at the event.
    #[error("No admissions left for {owner_id} at event {event_id}")]
    Exhausted { event_id: EventId, owner_id: UserId },

    /// A transfer window or the event itself is over.
    #[error("Expired: {0}")]
    Expired(String),

    /// The caller does not own the ticket or is not the named recipient.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The token belongs to a different event than the scanner expected.
    #[error("Token belongs to event {actual}, expected {expected}")]
    WrongEvent { expected: EventId, actual: EventId },

    /// The caller exceeded the transfer rate limit.
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The operation conflicts with the document's current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The request is malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The store failed, or write conflicts outlasted the retry budget.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Coarse classification of a [`LedgerError`], stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyUsed,
    Exhausted,
    Expired,
    Forbidden,
    WrongEvent,
    RateLimited,
    Conflict,
    InvalidInput,
    TransientStorage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyUsed => "already_used",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Expired => "expired",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::WrongEvent => "wrong_event",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::TransientStorage => "transient_storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::AlreadyUsed(_) => ErrorKind::AlreadyUsed,
            LedgerError::Exhausted { .. } => ErrorKind::Exhausted,
            LedgerError::Expired(_) => ErrorKind::Expired,
            LedgerError::Forbidden(_) => ErrorKind::Forbidden,
            LedgerError::WrongEvent { .. } => ErrorKind::WrongEvent,
            LedgerError::RateLimited { .. } => ErrorKind::RateLimited,
            LedgerError::Conflict(_) => ErrorKind::Conflict,
            LedgerError::InvalidInput(_) => ErrorKind::InvalidInput,
            LedgerError::Store(_) => ErrorKind::TransientStorage,
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        LedgerError::NotFound(what.to_string())
    }
}

impl Retryable for LedgerError {
    fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Store(e) if e.is_retryable())
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_transient() {
        let err = LedgerError::from(StoreError::Conflict("ticket".into()));
        assert_eq!(err.kind(), ErrorKind::TransientStorage);
        assert!(err.is_retryable());

        let err = LedgerError::from(StoreError::InvalidData("bad".into()));
        assert_eq!(err.kind(), ErrorKind::TransientStorage);
        assert!(!err.is_retryable());
    }

    #[test]
    fn domain_conflicts_are_not_retried() {
        let err = LedgerError::Conflict("pending transfer".into());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AlreadyUsed).unwrap();
        assert_eq!(json, "\"already_used\"");
        assert_eq!(ErrorKind::TransientStorage.to_string(), "transient_storage");
    }
}
