//! Compare-then-write reconciliation of event summaries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use common::{EventId, UserId};
use ledger_store::{EventUserSummary, LedgerStore, MAX_BATCH_WRITES, SummaryWrite};
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::fold::{Totals, fold_tickets};

/// Default number of summary rows written per batch.
pub const DEFAULT_BATCH_SIZE: usize = MAX_BATCH_WRITES;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    /// Report planned changes without writing them.
    pub dry_run: bool,
}

/// A summary row whose stored counters differ from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryChange {
    pub user_id: UserId,
    /// Stored counters, `None` when the row does not exist yet.
    pub before: Option<Totals>,
    pub after: Totals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub event_id: EventId,
    /// Number of (event, user) pairs compared.
    pub processed: usize,
    /// Number of rows written. Always zero for a dry run.
    pub updated: usize,
    /// Rows left alone because they changed after they were read.
    pub skipped: usize,
    pub dry_run: bool,
    pub changes: Vec<SummaryChange>,
}

/// Rebuilds `EventUserSummary` rows from the tickets of an event.
///
/// Only rows that differ are written, so a second run over unchanged tickets
/// writes nothing. Summaries with no tickets behind them are reset to zero.
///
/// Summaries are read before tickets and each write only lands if the row
/// still holds the counters that were read. A scan or issuance that commits
/// mid-run moves its summary in the same transaction, so that row is skipped
/// and picked up by the next run instead of being rolled back.
pub struct Reconciler<S: LedgerStore + ?Sized> {
    store: Arc<S>,
    batch_size: usize,
}

impl<S: LedgerStore + ?Sized> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            batch_size: self.batch_size,
        }
    }
}

impl<S: LedgerStore + ?Sized> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the rows written per batch, clamped to `1..=MAX_BATCH_WRITES`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_WRITES);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Reconciles the summaries of one event.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(
        &self,
        event_id: EventId,
        options: ReconcileOptions,
    ) -> Result<ReconcileReport> {
        if self.store.get_event(event_id).await?.is_none() {
            return Err(ReconcileError::EventNotFound(event_id));
        }

        let stored: BTreeMap<UserId, EventUserSummary> = self
            .store
            .summaries_for_event(event_id)
            .await?
            .into_iter()
            .map(|s| (s.user_id.clone(), s))
            .collect();
        let tickets = self.store.tickets_for_event(event_id).await?;
        let expected = fold_tickets(&tickets);

        let users: BTreeSet<&UserId> = expected.keys().chain(stored.keys()).collect();
        let processed = users.len();

        let changes: Vec<SummaryChange> = users
            .into_iter()
            .filter_map(|user_id| {
                let after = expected.get(user_id).copied().unwrap_or_default();
                let before = stored.get(user_id).map(Totals::of);
                let differs = match before {
                    Some(before) => before != after,
                    None => !after.is_zero(),
                };
                differs.then(|| SummaryChange {
                    user_id: user_id.clone(),
                    before,
                    after,
                })
            })
            .collect();

        let mut updated = 0;
        let mut skipped = 0;
        if !options.dry_run {
            let now = Utc::now();
            for chunk in changes.chunks(self.batch_size) {
                let writes: Vec<SummaryWrite> = chunk
                    .iter()
                    .map(|change| SummaryWrite {
                        summary: EventUserSummary {
                            event_id,
                            user_id: change.user_id.clone(),
                            total_tickets: change.after.total_tickets,
                            used_count: change.after.used_count,
                            updated_at: now,
                        },
                        expected: stored.get(&change.user_id).cloned(),
                    })
                    .collect();
                let written = self.store.write_summaries(&writes).await?;
                updated += written;
                skipped += writes.len() - written;
                metrics::counter!("reconcile_rows_updated_total").increment(written as u64);
                if written < writes.len() {
                    metrics::counter!("reconcile_rows_skipped_total")
                        .increment((writes.len() - written) as u64);
                    tracing::debug!(
                        %event_id,
                        skipped = writes.len() - written,
                        "summary rows moved during reconciliation"
                    );
                }
            }
        }

        tracing::info!(
            %event_id,
            processed,
            drifted = changes.len(),
            updated,
            skipped,
            dry_run = options.dry_run,
            "reconciliation complete"
        );

        Ok(ReconcileReport {
            event_id,
            processed,
            updated,
            skipped,
            dry_run: options.dry_run,
            changes,
        })
    }

    /// Reconciles every known event, logging failures and moving on.
    ///
    /// Returns the reports of the events that succeeded.
    pub async fn reconcile_all(&self, options: ReconcileOptions) -> Result<Vec<ReconcileReport>> {
        let event_ids = self.store.list_event_ids().await?;
        let mut reports = Vec::with_capacity(event_ids.len());
        for event_id in event_ids {
            match self.reconcile(event_id, options).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    metrics::counter!("reconcile_failures_total").increment(1);
                    tracing::warn!(%event_id, error = %e, "reconciliation failed");
                }
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use ledger_store::InMemoryLedgerStore;

    use super::*;

    #[test]
    fn batch_size_is_clamped() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let reconciler = Reconciler::new(store.clone());
        assert_eq!(reconciler.batch_size(), 400);
        assert_eq!(reconciler.clone().with_batch_size(0).batch_size(), 1);
        assert_eq!(reconciler.with_batch_size(5000).batch_size(), 400);
    }

    #[tokio::test]
    async fn unknown_event_is_an_error() {
        let reconciler = Reconciler::new(Arc::new(InMemoryLedgerStore::new()));
        let result = reconciler
            .reconcile(EventId::new(), ReconcileOptions::default())
            .await;
        assert!(matches!(result, Err(ReconcileError::EventNotFound(_))));
    }
}
