pub mod documents;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::{EventId, FulfillmentKey, TicketId, TransferId, UserId};
pub use documents::{
    EventRecord, EventUserSummary, Fulfillment, FulfillmentStatus, ItemError, Recipient,
    SummaryDelta, SummaryWrite, Ticket, TicketRef, TokenIndexEntry, Transfer, TransferStatus,
};
pub use error::{Result, StoreError};
pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use store::{
    LedgerStore, MAX_BATCH_WRITES, RetryPolicy, Retryable, Transaction, run_transaction,
    validate_batch,
};
