//! Shared identifier types used across the ticket ledger crates.

pub mod ids;

pub use ids::{EventId, FulfillmentKey, TicketId, TransferId, UserId};
