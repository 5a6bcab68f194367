use std::time::Duration;

use async_trait::async_trait;
use common::{EventId, FulfillmentKey, TicketId, TransferId, UserId};
use futures_util::future::BoxFuture;

use crate::documents::{
    EventRecord, EventUserSummary, Fulfillment, SummaryDelta, SummaryWrite, Ticket,
    TokenIndexEntry, Transfer,
};
use crate::{Result, StoreError};

/// Largest number of writes accepted by [`LedgerStore::write_summaries`].
pub const MAX_BATCH_WRITES: usize = 400;

/// A serializable unit of work over a small set of documents.
///
/// Reads inside a transaction are validated at commit: if any document read
/// here changed in the meantime, `commit` fails with [`StoreError::Conflict`]
/// and nothing is written. `insert_*` fails with a conflict when the
/// document already exists. Dropping a transaction without committing
/// discards its writes.
#[async_trait]
pub trait Transaction: Send {
    async fn get_event(&mut self, id: EventId) -> Result<Option<EventRecord>>;

    async fn update_event(&mut self, event: &EventRecord) -> Result<()>;

    async fn get_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>>;

    async fn insert_ticket(&mut self, ticket: &Ticket) -> Result<()>;

    async fn update_ticket(&mut self, ticket: &Ticket) -> Result<()>;

    async fn get_token(&mut self, token: &str) -> Result<Option<TokenIndexEntry>>;

    async fn insert_token(&mut self, entry: &TokenIndexEntry) -> Result<()>;

    async fn delete_token(&mut self, token: &str) -> Result<()>;

    async fn get_transfer(&mut self, id: TransferId) -> Result<Option<Transfer>>;

    async fn insert_transfer(&mut self, transfer: &Transfer) -> Result<()>;

    async fn update_transfer(&mut self, transfer: &Transfer) -> Result<()>;

    async fn get_fulfillment(&mut self, key: &FulfillmentKey) -> Result<Option<Fulfillment>>;

    async fn insert_fulfillment(&mut self, fulfillment: &Fulfillment) -> Result<()>;

    async fn update_fulfillment(&mut self, fulfillment: &Fulfillment) -> Result<()>;

    /// Adds `delta` to the (event, user) summary at commit time, creating the
    /// row if needed. Increments never read the current value and never
    /// conflict with each other.
    async fn increment_summary(
        &mut self,
        event_id: EventId,
        user_id: &UserId,
        delta: SummaryDelta,
    ) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Core trait for ledger store implementations.
///
/// Point reads and queries outside a transaction are routing hints only;
/// anything a mutation depends on must be re-read through [`Transaction`].
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Starts a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Creates an event. Fails with a conflict if the id is taken.
    async fn create_event(&self, event: &EventRecord) -> Result<()>;

    async fn get_event(&self, id: EventId) -> Result<Option<EventRecord>>;

    /// Returns the ids of all events, in no particular order.
    async fn list_event_ids(&self) -> Result<Vec<EventId>>;

    async fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>>;

    async fn lookup_token(&self, token: &str) -> Result<Option<TokenIndexEntry>>;

    /// Returns every ticket of an event, including deactivated ones.
    async fn tickets_for_event(&self, event_id: EventId) -> Result<Vec<Ticket>>;

    /// Returns every ticket a user holds (or held) at an event.
    async fn tickets_for_owner(&self, event_id: EventId, owner_id: &UserId) -> Result<Vec<Ticket>>;

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>>;

    async fn find_transfer_by_claim_hash(&self, hash: &str) -> Result<Option<Transfer>>;

    async fn get_fulfillment(&self, key: &FulfillmentKey) -> Result<Option<Fulfillment>>;

    async fn get_summary(
        &self,
        event_id: EventId,
        user_id: &UserId,
    ) -> Result<Option<EventUserSummary>>;

    async fn summaries_for_event(&self, event_id: EventId) -> Result<Vec<EventUserSummary>>;

    /// Overwrites a batch of summaries atomically, row by row only where the
    /// stored counters still equal [`SummaryWrite::expected`].
    ///
    /// Returns the number of rows written. A row that moved since it was read
    /// is left alone. Batches larger than [`MAX_BATCH_WRITES`] are rejected.
    async fn write_summaries(&self, writes: &[SummaryWrite]) -> Result<usize>;
}

/// Rejects batches that exceed [`MAX_BATCH_WRITES`].
pub fn validate_batch(size: usize) -> Result<()> {
    if size > MAX_BATCH_WRITES {
        return Err(StoreError::BatchTooLarge {
            size,
            limit: MAX_BATCH_WRITES,
        });
    }
    Ok(())
}

/// Errors that can tell whether a failed transaction is worth retrying.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        self.is_conflict()
    }
}

/// Bounded retry policy for optimistic transactions.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay before retry number `attempt` (1-based), with jitter in
    /// `[0.5, 1.0]` of the exponential value.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.initial_delay.as_secs_f64() * f64::from(1u32 << exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(capped * jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `body` inside a transaction and commits it, retrying the whole unit
/// on write conflicts up to `policy.max_attempts` times.
///
/// `body` may run more than once, so it must not have side effects outside
/// the transaction. Callers never observe partial writes: a failed attempt
/// is rolled back before the next one begins.
pub async fn run_transaction<S, T, E, F>(
    store: &S,
    policy: &RetryPolicy,
    mut body: F,
) -> std::result::Result<T, E>
where
    S: LedgerStore + ?Sized,
    T: Send,
    E: From<StoreError> + Retryable + Send,
    F: for<'t> FnMut(&'t mut dyn Transaction) -> BoxFuture<'t, std::result::Result<T, E>> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut tx = store.begin().await?;

        let error = match body(tx.as_mut()).await {
            Ok(value) => match tx.commit().await {
                Ok(()) => return Ok(value),
                Err(e) => E::from(e),
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "transaction rollback failed");
                }
                e
            }
        };

        if !error.is_retryable() || attempt >= policy.max_attempts {
            return Err(error);
        }

        metrics::counter!("store_transaction_retries_total").increment(1);
        let delay = policy.delay_for_attempt(attempt);
        tracing::debug!(attempt, ?delay, "transaction conflict, retrying");
        tokio::time::sleep(delay).await;
    }
}
