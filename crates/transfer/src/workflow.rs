//! Transfer workflow: create, claim, cancel.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{TicketId, TransferId, UserId};
use futures_util::FutureExt;
use ledger::ticket::insert_with_token;
use ledger::{Clock, LedgerError, Result, SystemClock, generate_token, hash_claim_token};
use ledger_store::{
    LedgerStore, Recipient, RetryPolicy, SummaryDelta, Ticket, Transaction, Transfer,
    TransferStatus, run_transaction,
};
use serde::Serialize;

use crate::services::{RateLimiter, TransferNotifier};
use crate::state::EffectiveStatus;

/// Transfer workflow settings.
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// How long a pending transfer can be claimed.
    pub ttl: Duration,
    /// Transfers one owner may create per window.
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(72),
            rate_limit_max: 10,
            rate_limit_window_secs: 3600,
            retry: RetryPolicy::default(),
        }
    }
}

/// Who is asking to cancel a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    User(UserId),
    /// Administrative override, allowed to cancel any pending transfer.
    Admin,
}

impl Requester {
    fn label(&self) -> String {
        match self {
            Requester::User(id) => id.to_string(),
            Requester::Admin => "admin".to_string(),
        }
    }
}

/// Identity of the user presenting a claim token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimer {
    pub user_id: UserId,
    pub email: Option<String>,
}

/// A freshly created transfer and the raw claim token for the recipient.
///
/// The raw token exists only here; the store keeps its hash.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedTransfer {
    pub transfer: Transfer,
    pub raw_claim_token: String,
}

/// A transfer as callers see it, with expiry applied.
#[derive(Debug, Clone, Serialize)]
pub struct TransferView {
    pub transfer: Transfer,
    pub effective_status: EffectiveStatus,
}

/// Trims and lower-cases an email address, rejecting obviously invalid ones.
pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    };
    if !valid {
        return Err(LedgerError::InvalidInput(format!(
            "invalid recipient email: {raw:?}"
        )));
    }
    Ok(email)
}

fn recipient_matches(recipient: &Recipient, claimer: &Claimer) -> bool {
    match &recipient.user_id {
        Some(user_id) => *user_id == claimer.user_id,
        None => claimer
            .email
            .as_deref()
            .and_then(|email| normalize_email(email).ok())
            .is_some_and(|email| email == recipient.email),
    }
}

/// Rejects transfers that can no longer be claimed.
fn check_claimable(transfer: &Transfer, claimer: &Claimer, now: DateTime<Utc>) -> Result<()> {
    match EffectiveStatus::of(transfer, now) {
        status if status.can_claim() => {}
        EffectiveStatus::Expired => {
            return Err(LedgerError::Expired(format!(
                "transfer {} expired at {}",
                transfer.id, transfer.expires_at
            )));
        }
        status => {
            return Err(LedgerError::Conflict(format!(
                "transfer {} is {status}",
                transfer.id
            )));
        }
    }
    if !recipient_matches(&transfer.recipient, claimer) {
        return Err(LedgerError::Forbidden(
            "claimer is not the transfer recipient".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
struct NewTransfer {
    id: TransferId,
    ticket_id: TicketId,
    from_owner_id: UserId,
    recipient: Recipient,
    claim_token_hash: String,
    now: DateTime<Utc>,
    ttl: Duration,
}

async fn create_in(tx: &mut dyn Transaction, new: NewTransfer) -> Result<Transfer> {
    let mut ticket = tx
        .get_ticket(new.ticket_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("ticket {}", new.ticket_id)))?;

    if ticket.owner_id != new.from_owner_id {
        return Err(LedgerError::Forbidden(
            "caller does not own the ticket".to_string(),
        ));
    }
    if ticket.is_transferred() || !ticket.active || ticket.used_count > 0 {
        return Err(LedgerError::AlreadyUsed(ticket.id));
    }

    if let Some(pending_id) = ticket.pending_transfer_id
        && let Some(pending) = tx.get_transfer(pending_id).await?
        && EffectiveStatus::of(&pending, new.now).blocks_new_transfer()
    {
        return Err(LedgerError::Conflict(format!(
            "ticket {} already has pending transfer {pending_id}",
            ticket.id
        )));
    }

    let event = tx
        .get_event(ticket.event_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("event {}", ticket.event_id)))?;
    if event.starts_at <= new.now {
        return Err(LedgerError::Expired(format!(
            "event {} has already started",
            event.id
        )));
    }

    let transfer = Transfer {
        id: new.id,
        event_id: ticket.event_id,
        ticket_id: ticket.id,
        from_owner_id: ticket.owner_id.clone(),
        recipient: new.recipient,
        claim_token_hash: new.claim_token_hash,
        status: TransferStatus::Pending,
        created_at: new.now,
        expires_at: new.now + new.ttl,
        claimed_by_user_id: None,
        claimed_ticket_id: None,
        cancelled_by: None,
    };
    tx.insert_transfer(&transfer).await?;

    ticket.pending_transfer_id = Some(transfer.id);
    tx.update_ticket(&ticket).await?;

    Ok(transfer)
}

async fn claim_in(
    tx: &mut dyn Transaction,
    transfer_id: TransferId,
    claimer: Claimer,
    now: DateTime<Utc>,
) -> Result<(Transfer, Ticket)> {
    let mut transfer = tx
        .get_transfer(transfer_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("transfer {transfer_id}")))?;
    check_claimable(&transfer, &claimer, now)?;

    let mut original = tx
        .get_ticket(transfer.ticket_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("ticket {}", transfer.ticket_id)))?;

    if original.pending_transfer_id != Some(transfer.id) {
        return Err(LedgerError::Conflict(format!(
            "ticket {} is no longer offered by transfer {}",
            original.id, transfer.id
        )));
    }
    if original.is_transferred() || original.used_count > 0 {
        return Err(LedgerError::AlreadyUsed(original.id));
    }

    let mut replacement = Ticket::new(
        original.event_id,
        claimer.user_id.clone(),
        original.quantity,
        generate_token(),
        now,
    );
    replacement.previous_owner_id = Some(original.owner_id.clone());
    replacement.order_ref = original.order_ref.clone();
    insert_with_token(tx, &replacement, now).await?;

    if let Some(old_token) = original.token.take() {
        tx.delete_token(&old_token).await?;
    }
    original.transferred_to = Some(replacement.id);
    original.pending_transfer_id = None;
    original.active = original.derived_active();
    tx.update_ticket(&original).await?;

    let moved = SummaryDelta::tickets(original.quantity);
    tx.increment_summary(original.event_id, &original.owner_id, moved.negate())
        .await?;
    tx.increment_summary(replacement.event_id, &replacement.owner_id, moved)
        .await?;

    transfer.status = TransferStatus::Claimed;
    transfer.claimed_by_user_id = Some(claimer.user_id);
    transfer.claimed_ticket_id = Some(replacement.id);
    tx.update_transfer(&transfer).await?;

    Ok((transfer, replacement))
}

async fn cancel_in(
    tx: &mut dyn Transaction,
    transfer_id: TransferId,
    requester: Requester,
) -> Result<Transfer> {
    let mut transfer = tx
        .get_transfer(transfer_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("transfer {transfer_id}")))?;

    if let Requester::User(user_id) = &requester
        && *user_id != transfer.from_owner_id
    {
        return Err(LedgerError::Forbidden(
            "only the owner can cancel this transfer".to_string(),
        ));
    }
    if transfer.status != TransferStatus::Pending {
        return Err(LedgerError::Conflict(format!(
            "transfer {} is {}",
            transfer.id, transfer.status
        )));
    }

    if let Some(mut ticket) = tx.get_ticket(transfer.ticket_id).await?
        && ticket.pending_transfer_id == Some(transfer.id)
    {
        ticket.pending_transfer_id = None;
        tx.update_ticket(&ticket).await?;
    }

    transfer.status = TransferStatus::Cancelled;
    transfer.cancelled_by = Some(requester.label());
    tx.update_transfer(&transfer).await?;
    Ok(transfer)
}

/// Orchestrates ticket transfers.
///
/// Every state change happens in one store transaction that touches the
/// transfer, the affected tickets, and their token index entries together.
/// Rate limiting runs before the transaction and notifications after it;
/// neither can undo or fail a committed change.
pub struct TransferWorkflow<S, R, N>
where
    S: LedgerStore + ?Sized,
    R: RateLimiter,
    N: TransferNotifier,
{
    store: Arc<S>,
    limiter: R,
    notifier: N,
    clock: Arc<dyn Clock>,
    config: TransferConfig,
}

impl<S, R, N> TransferWorkflow<S, R, N>
where
    S: LedgerStore + ?Sized,
    R: RateLimiter,
    N: TransferNotifier,
{
    pub fn new(store: Arc<S>, limiter: R, notifier: N) -> Self {
        Self::with_clock(
            store,
            limiter,
            notifier,
            Arc::new(SystemClock),
            TransferConfig::default(),
        )
    }

    pub fn with_clock(
        store: Arc<S>,
        limiter: R,
        notifier: N,
        clock: Arc<dyn Clock>,
        config: TransferConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            notifier,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Offers `ticket_id` to `recipient`.
    ///
    /// The ticket stays scannable by its owner until the transfer is claimed.
    #[tracing::instrument(skip(self, recipient), fields(to_email = %recipient.email))]
    pub async fn create(
        &self,
        ticket_id: TicketId,
        from_owner_id: &UserId,
        recipient: Recipient,
    ) -> Result<CreatedTransfer> {
        let recipient = Recipient {
            email: normalize_email(&recipient.email)?,
            ..recipient
        };
        if recipient.user_id.as_ref() == Some(from_owner_id) {
            return Err(LedgerError::InvalidInput(
                "cannot transfer a ticket to its owner".to_string(),
            ));
        }

        // Only well-formed requests count against the owner's quota.
        self.check_rate_limit(from_owner_id).await?;

        let raw_claim_token = generate_token();
        let new = NewTransfer {
            id: TransferId::new(),
            ticket_id,
            from_owner_id: from_owner_id.clone(),
            recipient,
            claim_token_hash: hash_claim_token(&raw_claim_token),
            now: self.clock.now(),
            ttl: self.config.ttl,
        };

        let transfer = run_transaction(self.store.as_ref(), &self.config.retry, |tx| {
            create_in(tx, new.clone()).boxed()
        })
        .await?;

        metrics::counter!("transfers_total", "action" => "created").increment(1);
        tracing::info!(
            transfer_id = %transfer.id,
            ticket_id = %transfer.ticket_id,
            expires_at = %transfer.expires_at,
            "transfer created"
        );

        if let Err(e) = self
            .notifier
            .transfer_created(&transfer, &raw_claim_token)
            .await
        {
            tracing::warn!(transfer_id = %transfer.id, error = %e, "transfer notification failed");
        }

        Ok(CreatedTransfer {
            transfer,
            raw_claim_token,
        })
    }

    async fn check_rate_limit(&self, owner_id: &UserId) -> Result<()> {
        let key = format!("transfer:create:{owner_id}");
        let decision = self
            .limiter
            .allow(
                &key,
                self.config.rate_limit_max,
                self.config.rate_limit_window_secs,
            )
            .await;

        match decision {
            Ok(decision) if decision.allowed => Ok(()),
            Ok(decision) => {
                metrics::counter!("transfers_total", "action" => "rate_limited").increment(1);
                Err(LedgerError::RateLimited {
                    retry_after_secs: decision.retry_after_secs,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "rate limiter unavailable, allowing request");
                Ok(())
            }
        }
    }

    /// Claims the transfer behind `raw_claim_token` for `claimer`.
    ///
    /// Returns the new ticket. The original ticket is deactivated and its
    /// token stops resolving.
    #[tracing::instrument(skip(self, raw_claim_token))]
    pub async fn claim(&self, raw_claim_token: &str, claimer: Claimer) -> Result<Ticket> {
        let hash = hash_claim_token(raw_claim_token);
        let found = self
            .store
            .find_transfer_by_claim_hash(&hash)
            .await?
            .ok_or_else(|| LedgerError::not_found("claim token"))?;

        let now = self.clock.now();
        check_claimable(&found, &claimer, now)?;

        let transfer_id = found.id;
        let (transfer, ticket) = run_transaction(self.store.as_ref(), &self.config.retry, |tx| {
            claim_in(tx, transfer_id, claimer.clone(), now).boxed()
        })
        .await?;

        metrics::counter!("transfers_total", "action" => "claimed").increment(1);
        tracing::info!(
            transfer_id = %transfer.id,
            original_ticket_id = %transfer.ticket_id,
            ticket_id = %ticket.id,
            "transfer claimed"
        );

        if let Err(e) = self.notifier.transfer_claimed(&transfer, &ticket).await {
            tracing::warn!(transfer_id = %transfer.id, error = %e, "transfer notification failed");
        }

        Ok(ticket)
    }

    /// Cancels a pending transfer on behalf of its owner or an admin.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, transfer_id: TransferId, requester: Requester) -> Result<Transfer> {
        let transfer = run_transaction(self.store.as_ref(), &self.config.retry, |tx| {
            cancel_in(tx, transfer_id, requester.clone()).boxed()
        })
        .await?;

        metrics::counter!("transfers_total", "action" => "cancelled").increment(1);
        tracing::info!(
            transfer_id = %transfer.id,
            cancelled_by = transfer.cancelled_by.as_deref().unwrap_or_default(),
            "transfer cancelled"
        );

        if let Err(e) = self.notifier.transfer_cancelled(&transfer).await {
            tracing::warn!(transfer_id = %transfer.id, error = %e, "transfer notification failed");
        }

        Ok(transfer)
    }

    /// Loads a transfer with its effective status.
    pub async fn get(&self, transfer_id: TransferId) -> Result<TransferView> {
        let transfer = self
            .store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("transfer {transfer_id}")))?;
        let effective_status = EffectiveStatus::of(&transfer, self.clock.now());
        Ok(TransferView {
            transfer,
            effective_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  B@X.com ").unwrap(), "b@x.com");
    }

    #[test]
    fn malformed_emails_are_rejected() {
        for bad in ["", "nobody", "@x.com", "b@", "a@b@c"] {
            assert!(normalize_email(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn recipient_match_prefers_user_id() {
        let recipient = Recipient {
            user_id: Some("bob".into()),
            email: "b@x.com".into(),
            username: None,
        };
        let right_email_wrong_user = Claimer {
            user_id: "mallory".into(),
            email: Some("b@x.com".into()),
        };
        assert!(!recipient_matches(&recipient, &right_email_wrong_user));

        let bob = Claimer {
            user_id: "bob".into(),
            email: None,
        };
        assert!(recipient_matches(&recipient, &bob));
    }

    #[test]
    fn recipient_match_by_email_ignores_case() {
        let recipient = Recipient {
            user_id: None,
            email: "b@x.com".into(),
            username: None,
        };
        let claimer = Claimer {
            user_id: "bob".into(),
            email: Some(" B@X.COM".into()),
        };
        assert!(recipient_matches(&recipient, &claimer));

        let anonymous = Claimer {
            user_id: "bob".into(),
            email: None,
        };
        assert!(!recipient_matches(&recipient, &anonymous));
    }
}
