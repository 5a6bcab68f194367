//! Transfer notification trait and implementations.

use std::sync::Arc;

use async_trait::async_trait;
use common::{TicketId, TransferId};
use ledger_store::{Ticket, Transfer};
use tokio::sync::RwLock;

use crate::error::ServiceError;

/// Trait for telling people about transfer state changes.
///
/// Delivery happens after the ledger change has committed.
#[async_trait]
pub trait TransferNotifier: Send + Sync {
    /// Sends the raw claim token to the recipient.
    async fn transfer_created(
        &self,
        transfer: &Transfer,
        raw_claim_token: &str,
    ) -> Result<(), ServiceError>;

    async fn transfer_claimed(
        &self,
        transfer: &Transfer,
        new_ticket: &Ticket,
    ) -> Result<(), ServiceError>;

    async fn transfer_cancelled(&self, transfer: &Transfer) -> Result<(), ServiceError>;
}

/// Notifier that only writes log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl TransferNotifier for TracingNotifier {
    async fn transfer_created(
        &self,
        transfer: &Transfer,
        _raw_claim_token: &str,
    ) -> Result<(), ServiceError> {
        tracing::info!(
            transfer_id = %transfer.id,
            to_email = %transfer.recipient.email,
            expires_at = %transfer.expires_at,
            "transfer offer ready for delivery"
        );
        Ok(())
    }

    async fn transfer_claimed(
        &self,
        transfer: &Transfer,
        new_ticket: &Ticket,
    ) -> Result<(), ServiceError> {
        tracing::info!(
            transfer_id = %transfer.id,
            from_owner_id = %transfer.from_owner_id,
            ticket_id = %new_ticket.id,
            "transfer claim notice ready for delivery"
        );
        Ok(())
    }

    async fn transfer_cancelled(&self, transfer: &Transfer) -> Result<(), ServiceError> {
        tracing::info!(
            transfer_id = %transfer.id,
            to_email = %transfer.recipient.email,
            "transfer cancellation notice ready for delivery"
        );
        Ok(())
    }
}

/// A notification recorded by [`InMemoryNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Created {
        transfer_id: TransferId,
        raw_claim_token: String,
    },
    Claimed {
        transfer_id: TransferId,
        ticket_id: TicketId,
    },
    Cancelled {
        transfer_id: TransferId,
    },
}

#[derive(Debug, Default)]
struct InMemoryNotifierState {
    sent: Vec<Notification>,
    fail: bool,
}

/// In-memory notifier for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    state: Arc<RwLock<InMemoryNotifierState>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures every delivery to fail.
    pub async fn set_fail(&self, fail: bool) {
        self.state.write().await.fail = fail;
    }

    /// Returns the notifications delivered so far.
    pub async fn sent(&self) -> Vec<Notification> {
        self.state.read().await.sent.clone()
    }

    async fn record(&self, notification: Notification) -> Result<(), ServiceError> {
        let mut state = self.state.write().await;
        if state.fail {
            return Err(ServiceError::Notifier("mailer unavailable".to_string()));
        }
        state.sent.push(notification);
        Ok(())
    }
}

#[async_trait]
impl TransferNotifier for InMemoryNotifier {
    async fn transfer_created(
        &self,
        transfer: &Transfer,
        raw_claim_token: &str,
    ) -> Result<(), ServiceError> {
        self.record(Notification::Created {
            transfer_id: transfer.id,
            raw_claim_token: raw_claim_token.to_string(),
        })
        .await
    }

    async fn transfer_claimed(
        &self,
        transfer: &Transfer,
        new_ticket: &Ticket,
    ) -> Result<(), ServiceError> {
        self.record(Notification::Claimed {
            transfer_id: transfer.id,
            ticket_id: new_ticket.id,
        })
        .await
    }

    async fn transfer_cancelled(&self, transfer: &Transfer) -> Result<(), ServiceError> {
        self.record(Notification::Cancelled {
            transfer_id: transfer.id,
        })
        .await
    }
}
