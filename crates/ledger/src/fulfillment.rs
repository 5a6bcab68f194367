//! Idempotent conversion of a paid order into tickets.
//!
//! The first `settle` call for a key claims it by writing a `processing`
//! record; every later call replays the stored record without touching
//! inventory or tickets. Each issued ticket is appended to the record in the
//! same transaction that creates it, so a ticket and its reference are
//! never written separately.
//!
//! Once a key is claimed the rest of the settlement runs on its own task, so
//! a caller that stops waiting does not strand a half-issued record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::FulfillmentKey;
use futures_util::FutureExt;
use ledger_store::{
    Fulfillment, FulfillmentStatus, ItemError, LedgerStore, TicketRef, Transaction,
    run_transaction,
};
use serde::Serialize;
use tracing::Instrument;

use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::ticket::{IssueRequest, issue_in};

/// Outcome of [`FulfillmentGuard::settle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FulfillmentResult {
    pub fulfillment: Fulfillment,
    /// True when the key had been settled before and nothing was issued.
    pub replayed: bool,
}

/// Claims `key`, or returns the record that already holds it.
async fn claim_key(
    tx: &mut dyn Transaction,
    key: FulfillmentKey,
    now: DateTime<Utc>,
) -> Result<Option<Fulfillment>> {
    if let Some(existing) = tx.get_fulfillment(&key).await? {
        return Ok(Some(existing));
    }
    tx.insert_fulfillment(&Fulfillment::processing(key, now))
        .await?;
    Ok(None)
}

/// Issues one ticket and appends its reference to the fulfillment record.
async fn issue_item(
    tx: &mut dyn Transaction,
    key: FulfillmentKey,
    request: IssueRequest,
    now: DateTime<Utc>,
) -> Result<TicketRef> {
    let mut record = tx
        .get_fulfillment(&key)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("fulfillment {key}")))?;

    let ticket = issue_in(tx, request, Some(key.to_string()), now).await?;
    let ticket_ref = TicketRef {
        event_id: ticket.event_id,
        ticket_id: ticket.id,
        owner_id: ticket.owner_id,
        quantity: ticket.quantity,
    };

    record.created_ticket_refs.push(ticket_ref.clone());
    record.updated_at = now;
    tx.update_fulfillment(&record).await?;
    Ok(ticket_ref)
}

/// Records item errors and the final status.
async fn finish(
    tx: &mut dyn Transaction,
    key: FulfillmentKey,
    errors: Vec<ItemError>,
    status: FulfillmentStatus,
    now: DateTime<Utc>,
) -> Result<Fulfillment> {
    let mut record = tx
        .get_fulfillment(&key)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("fulfillment {key}")))?;
    record.errors = errors;
    record.status = status;
    record.updated_at = now;
    tx.update_fulfillment(&record).await?;
    Ok(record)
}

/// Final status for a settle run.
///
/// A run fails only when it had items and none of them issued.
fn final_status(requested: usize, issued: usize) -> FulfillmentStatus {
    if requested > 0 && issued == 0 {
        FulfillmentStatus::Failed
    } else {
        FulfillmentStatus::Completed
    }
}

/// Idempotency barrier between payments and ticket issuance.
pub struct FulfillmentGuard<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl<S: LedgerStore + ?Sized> Clone for FulfillmentGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: self.config,
        }
    }
}

impl<S: LedgerStore + ?Sized> FulfillmentGuard<S> {
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

    /// Loads the stored record for `key`.
    pub async fn get(&self, key: &FulfillmentKey) -> Result<Option<Fulfillment>> {
        Ok(self.store.get_fulfillment(key).await?)
    }

    async fn run_settlement(
        self,
        key: FulfillmentKey,
        requests: Vec<IssueRequest>,
    ) -> Result<FulfillmentResult> {
        let now = self.clock.now();
        let claimed = run_transaction(self.store.as_ref(), &self.config.retry, |tx| {
            claim_key(tx, key.clone(), now).boxed()
        })
        .await?;

        if let Some(existing) = claimed {
            metrics::counter!("fulfillments_total", "outcome" => "replayed").increment(1);
            tracing::info!(status = %existing.status, "fulfillment replayed");
            return Ok(FulfillmentResult {
                fulfillment: existing,
                replayed: true,
            });
        }

        let requested = requests.len();
        let mut issued = 0usize;
        let mut errors = Vec::new();

        for (index, request) in requests.into_iter().enumerate() {
            let now = self.clock.now();
            let result = run_transaction(self.store.as_ref(), &self.config.retry, |tx| {
                issue_item(tx, key.clone(), request.clone(), now).boxed()
            })
            .await;

            match result {
                Ok(ticket_ref) => {
                    issued += 1;
                    metrics::counter!("tickets_issued_total").increment(1);
                    tracing::info!(
                        index,
                        ticket_id = %ticket_ref.ticket_id,
                        event_id = %ticket_ref.event_id,
                        "fulfillment item issued"
                    );
                }
                Err(e) => {
                    tracing::warn!(index, kind = %e.kind(), error = %e, "fulfillment item failed");
                    errors.push(ItemError {
                        index,
                        kind: e.kind().as_str().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let status = final_status(requested, issued);
        let now = self.clock.now();
        let record = run_transaction(self.store.as_ref(), &self.config.retry, |tx| {
            finish(tx, key.clone(), errors.clone(), status, now).boxed()
        })
        .await?;

        metrics::counter!("fulfillments_total", "outcome" => status.as_str()).increment(1);
        tracing::info!(
            %status,
            issued,
            failed = record.errors.len(),
            "fulfillment settled"
        );

        Ok(FulfillmentResult {
            fulfillment: record,
            replayed: false,
        })
    }
}

impl<S: LedgerStore + ?Sized + 'static> FulfillmentGuard<S> {
    /// Issues `requests` for `key` exactly once.
    ///
    /// Item failures are recorded on the fulfillment and do not undo items
    /// that were already issued. A stored record is returned unchanged on
    /// every later call, including a `failed` one.
    ///
    /// The settlement runs to completion even if the returned future is
    /// dropped; a caller that stops waiting re-reads the outcome with
    /// [`FulfillmentGuard::get`].
    #[tracing::instrument(skip(self, requests), fields(items = requests.len()))]
    pub async fn settle(
        &self,
        key: FulfillmentKey,
        requests: Vec<IssueRequest>,
    ) -> Result<FulfillmentResult> {
        if key.as_str().trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "fulfillment key must not be empty".to_string(),
            ));
        }

        let settlement = self.clone().run_settlement(key, requests);
        match tokio::spawn(settlement.in_current_span()).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(LedgerError::Conflict(format!(
                "settlement task did not finish: {e}"
            ))),
        }
    }
}
