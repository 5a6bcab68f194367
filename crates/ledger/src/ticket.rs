//! Ticket issuance and admission consumption.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{EventId, TicketId, UserId};
use futures_util::FutureExt;
use ledger_store::{
    LedgerStore, SummaryDelta, Ticket, TokenIndexEntry, Transaction, run_transaction,
};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::token::generate_token;

/// A request to issue one ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRequest {
    pub event_id: EventId,
    pub owner_id: UserId,
    pub quantity: u32,
}

impl IssueRequest {
    pub fn new(event_id: EventId, owner_id: impl Into<UserId>, quantity: u32) -> Self {
        Self {
            event_id,
            owner_id: owner_id.into(),
            quantity,
        }
    }
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeResult {
    pub ticket_id: TicketId,
    pub event_id: EventId,
    /// Admissions left on the ticket after this one.
    pub remaining: u32,
    pub active: bool,
}

/// Picks the ticket an owner scan should consume.
///
/// Transferred and exhausted tickets are skipped. Among the rest the ticket
/// with the most admissions left wins, then the earliest issued, then the
/// lowest ticket id.
pub fn select_for_owner(tickets: &[Ticket]) -> Option<&Ticket> {
    tickets
        .iter()
        .filter(|t| !t.is_transferred() && t.remaining() > 0)
        .min_by(|a, b| owner_scan_order(a, b))
}

fn owner_scan_order(a: &Ticket, b: &Ticket) -> Ordering {
    b.remaining()
        .cmp(&a.remaining())
        .then_with(|| a.issued_at.cmp(&b.issued_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Writes a ticket together with the index entry for its token.
pub async fn insert_with_token(
    tx: &mut dyn Transaction,
    ticket: &Ticket,
    now: DateTime<Utc>,
) -> Result<()> {
    tx.insert_ticket(ticket).await?;
    if let Some(token) = &ticket.token {
        tx.insert_token(&TokenIndexEntry {
            token: token.clone(),
            event_id: ticket.event_id,
            ticket_id: ticket.id,
            created_at: now,
        })
        .await?;
    }
    Ok(())
}

/// Issues a ticket inside `tx`: takes inventory, creates the ticket and its
/// token, and adds the quantity to the owner's summary.
///
/// Inventory clamps at zero instead of rejecting the issue.
pub async fn issue_in(
    tx: &mut dyn Transaction,
    request: IssueRequest,
    order_ref: Option<String>,
    now: DateTime<Utc>,
) -> Result<Ticket> {
    if request.quantity == 0 {
        return Err(LedgerError::InvalidInput(
            "quantity must be at least 1".to_string(),
        ));
    }

    let mut event = tx
        .get_event(request.event_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("event {}", request.event_id)))?;

    let before = event.remaining_quantity;
    if event.take_inventory(request.quantity) {
        tracing::warn!(
            event_id = %event.id,
            requested = request.quantity,
            remaining = before,
            "inventory exhausted, clamping at zero"
        );
    }
    tx.update_event(&event).await?;

    let mut ticket = Ticket::new(
        event.id,
        request.owner_id,
        request.quantity,
        generate_token(),
        now,
    );
    ticket.order_ref = order_ref;
    insert_with_token(tx, &ticket, now).await?;

    tx.increment_summary(
        ticket.event_id,
        &ticket.owner_id,
        SummaryDelta::tickets(ticket.quantity),
    )
    .await?;

    Ok(ticket)
}

/// Consumes one admission from `ticket_id` inside `tx`.
///
/// When `via_token` is set the token must still be the ticket's live token.
pub async fn consume_in(
    tx: &mut dyn Transaction,
    ticket_id: TicketId,
    via_token: Option<String>,
) -> Result<ConsumeResult> {
    let ticket = tx
        .get_ticket(ticket_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("ticket {ticket_id}")))?;

    if let Some(token) = via_token
        && ticket.token.as_deref() != Some(token.as_str())
    {
        return Err(LedgerError::not_found("token"));
    }

    apply_consume(tx, ticket).await
}

async fn apply_consume(tx: &mut dyn Transaction, mut ticket: Ticket) -> Result<ConsumeResult> {
    if ticket.is_transferred() {
        return Err(LedgerError::not_found(format!("ticket {}", ticket.id)));
    }
    if ticket.used_count >= ticket.quantity {
        return Err(LedgerError::AlreadyUsed(ticket.id));
    }

    ticket.used_count += 1;
    ticket.active = ticket.derived_active();
    tx.update_ticket(&ticket).await?;
    tx.increment_summary(ticket.event_id, &ticket.owner_id, SummaryDelta::one_use())
        .await?;

    Ok(ConsumeResult {
        ticket_id: ticket.id,
        event_id: ticket.event_id,
        remaining: ticket.remaining(),
        active: ticket.active,
    })
}

/// Re-reads the candidate tickets inside `tx`, selects one, and consumes it.
async fn consume_owner_in(
    tx: &mut dyn Transaction,
    event_id: EventId,
    owner_id: UserId,
    candidates: Vec<TicketId>,
) -> Result<ConsumeResult> {
    let mut fresh = Vec::with_capacity(candidates.len());
    for id in candidates {
        if let Some(ticket) = tx.get_ticket(id).await?
            && ticket.owner_id == owner_id
            && ticket.event_id == event_id
        {
            fresh.push(ticket);
        }
    }

    let Some(selected) = select_for_owner(&fresh).cloned() else {
        return Err(LedgerError::Exhausted { event_id, owner_id });
    };
    apply_consume(tx, selected).await
}

/// Service for issuing and consuming tickets.
///
/// Every mutation runs in its own store transaction and is retried on write
/// conflicts, so concurrent scans of one ticket never over-consume it.
pub struct TicketLedger<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl<S: LedgerStore + ?Sized> Clone for TicketLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: self.config,
        }
    }
}

impl<S: LedgerStore + ?Sized> TicketLedger<S> {
    /// Creates a ledger backed by `store` using wall-clock time.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), LedgerConfig::default())
    }

    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>, config: LedgerConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Issues one ticket for `request`.
    #[tracing::instrument(skip(self))]
    pub async fn issue(&self, request: IssueRequest, order_ref: Option<String>) -> Result<Ticket> {
        let now = self.clock.now();
        let ticket = run_transaction(self.store.as_ref(), &self.config.retry, |tx| {
            issue_in(tx, request.clone(), order_ref.clone(), now).boxed()
        })
        .await?;

        metrics::counter!("tickets_issued_total").increment(1);
        tracing::info!(
            ticket_id = %ticket.id,
            event_id = %ticket.event_id,
            owner_id = %ticket.owner_id,
            quantity = ticket.quantity,
            "ticket issued"
        );
        Ok(ticket)
    }

    /// Consumes one admission from the ticket `token` points at.
    ///
    /// With `expected_event` set, a token for any other event is rejected
    /// with [`LedgerError::WrongEvent`] before anything is written.
    #[tracing::instrument(skip(self, token))]
    pub async fn consume_by_token(
        &self,
        token: &str,
        expected_event: Option<EventId>,
    ) -> Result<ConsumeResult> {
        let result = self.consume_token_inner(token, expected_event).await;
        record_scan("token", &result);
        result
    }

    async fn consume_token_inner(
        &self,
        token: &str,
        expected_event: Option<EventId>,
    ) -> Result<ConsumeResult> {
        let entry = self
            .store
            .lookup_token(token)
            .await?
            .ok_or_else(|| LedgerError::not_found("token"))?;

        if let Some(expected) = expected_event
            && expected != entry.event_id
        {
            return Err(LedgerError::WrongEvent {
                expected,
                actual: entry.event_id,
            });
        }

        let ticket_id = entry.ticket_id;
        let token = token.to_string();
        run_transaction(self.store.as_ref(), &self.config.retry, |tx| {
            consume_in(tx, ticket_id, Some(token.clone())).boxed()
        })
        .await
    }

    /// Consumes one admission from the owner's best ticket at the event.
    #[tracing::instrument(skip(self))]
    pub async fn consume_by_owner(
        &self,
        event_id: EventId,
        owner_id: &UserId,
    ) -> Result<ConsumeResult> {
        let result = self.consume_owner_inner(event_id, owner_id).await;
        record_scan("owner", &result);
        result
    }

    async fn consume_owner_inner(
        &self,
        event_id: EventId,
        owner_id: &UserId,
    ) -> Result<ConsumeResult> {
        let tickets = self.store.tickets_for_owner(event_id, owner_id).await?;
        let candidates: Vec<TicketId> = tickets
            .iter()
            .filter(|t| !t.is_transferred() && t.remaining() > 0)
            .map(|t| t.id)
            .collect();

        if candidates.is_empty() {
            return Err(LedgerError::Exhausted {
                event_id,
                owner_id: owner_id.clone(),
            });
        }

        run_transaction(self.store.as_ref(), &self.config.retry, |tx| {
            consume_owner_in(tx, event_id, owner_id.clone(), candidates.clone()).boxed()
        })
        .await
    }

    /// Loads a ticket by id.
    pub async fn ticket(&self, id: TicketId) -> Result<Option<Ticket>> {
        Ok(self.store.get_ticket(id).await?)
    }

    /// Resolves a scan token to its live ticket.
    pub async fn lookup_token(&self, token: &str) -> Result<Option<Ticket>> {
        let Some(entry) = self.store.lookup_token(token).await? else {
            return Ok(None);
        };
        Ok(self.store.get_ticket(entry.ticket_id).await?)
    }

    /// Lists an owner's tickets at an event, including transferred ones.
    pub async fn tickets_for_owner(
        &self,
        event_id: EventId,
        owner_id: &UserId,
    ) -> Result<Vec<Ticket>> {
        Ok(self.store.tickets_for_owner(event_id, owner_id).await?)
    }
}

fn record_scan(mode: &'static str, result: &Result<ConsumeResult>) {
    match result {
        Ok(consumed) => {
            metrics::counter!("ticket_scans_total", "mode" => mode, "outcome" => "accepted")
                .increment(1);
            tracing::info!(
                ticket_id = %consumed.ticket_id,
                remaining = consumed.remaining,
                active = consumed.active,
                "admission consumed"
            );
        }
        Err(e) => {
            let outcome = e.kind().as_str();
            metrics::counter!("ticket_scans_total", "mode" => mode, "outcome" => outcome)
                .increment(1);
            tracing::info!(outcome, error = %e, "scan rejected");
        }
    }
}
