//! Ticket ledger for the ticketing system.
//!
//! This crate owns the rules for changing tickets:
//! - `TicketLedger` issues tickets and consumes admissions
//! - `FulfillmentGuard` turns a paid order into tickets exactly once
//! - `LedgerError` is the typed failure shared by every ledger operation
//!
//! The transactional building blocks in [`ticket`] are public so other
//! workflows can compose them inside their own transactions.

pub mod clock;
pub mod config;
pub mod error;
pub mod fulfillment;
pub mod ticket;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use error::{ErrorKind, LedgerError, Result};
pub use fulfillment::{FulfillmentGuard, FulfillmentResult};
pub use ticket::{ConsumeResult, IssueRequest, TicketLedger, select_for_owner};
pub use token::{generate_token, hash_claim_token};
