//! Reconciliation error types.

use common::EventId;
use thiserror::Error;

/// Errors that can occur during reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// An error occurred in the ledger store.
    #[error("Ledger store error: {0}")]
    Store(#[from] ledger_store::StoreError),

    /// The event to reconcile does not exist.
    #[error("Event not found: {0}")]
    EventNotFound(EventId),
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
