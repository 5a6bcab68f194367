//! Persisted document types.
//!
//! Every document is addressable by a stable primary key. The store only
//! moves these values in and out; the rules for changing them live in the
//! ledger and transfer crates.

use chrono::{DateTime, Utc};
use common::{EventId, FulfillmentKey, TicketId, TransferId, UserId};
use serde::{Deserialize, Serialize};

/// An admission event and its remaining inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    /// Admissions still available. Never negative, never increases.
    pub remaining_quantity: u32,
}

impl EventRecord {
    pub fn new(name: impl Into<String>, starts_at: DateTime<Utc>, remaining_quantity: u32) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            starts_at,
            remaining_quantity,
        }
    }

    /// Decrements inventory by `quantity`, clamping at zero.
    ///
    /// Returns true when the requested quantity exceeded what was left.
    pub fn take_inventory(&mut self, quantity: u32) -> bool {
        let oversold = quantity > self.remaining_quantity;
        self.remaining_quantity = self.remaining_quantity.saturating_sub(quantity);
        oversold
    }
}

/// A ticket: one or more admissions purchased together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub event_id: EventId,
    pub owner_id: UserId,
    /// Admissions granted. At least 1, immutable.
    pub quantity: u32,
    /// Admissions consumed so far, `0..=quantity`.
    pub used_count: u32,
    /// Persisted, but must always equal [`Ticket::derived_active`].
    pub active: bool,
    /// Current scan token. `None` once superseded by a transfer claim.
    pub token: Option<String>,
    pub pending_transfer_id: Option<TransferId>,
    pub previous_owner_id: Option<UserId>,
    /// Order or payment reference that produced this ticket.
    pub order_ref: Option<String>,
    pub issued_at: DateTime<Utc>,
    /// Ticket that replaced this one when a transfer was claimed.
    pub transferred_to: Option<TicketId>,
}

impl Ticket {
    /// Builds a fresh, unused ticket.
    pub fn new(
        event_id: EventId,
        owner_id: UserId,
        quantity: u32,
        token: String,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TicketId::new(),
            event_id,
            owner_id,
            quantity,
            used_count: 0,
            active: true,
            token: Some(token),
            pending_transfer_id: None,
            previous_owner_id: None,
            order_ref: None,
            issued_at,
            transferred_to: None,
        }
    }

    /// Admissions left on this ticket.
    pub fn remaining(&self) -> u32 {
        self.quantity.saturating_sub(self.used_count)
    }

    /// Returns true once ownership moved to another ticket.
    pub fn is_transferred(&self) -> bool {
        self.transferred_to.is_some()
    }

    /// The value `active` must hold.
    pub fn derived_active(&self) -> bool {
        !self.is_transferred() && self.used_count < self.quantity
    }
}

/// Reverse index from a scan token to the ticket it admits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIndexEntry {
    pub token: String,
    pub event_id: EventId,
    pub ticket_id: TicketId,
    pub created_at: DateTime<Utc>,
}

/// Stored status of a transfer. Expiry is not a stored status; it is
/// derived when the transfer is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Claimed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Claimed => "claimed",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransferStatus::Pending),
            "claimed" => Some(TransferStatus::Claimed),
            "cancelled" => Some(TransferStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a transfer is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: Option<UserId>,
    /// Normalized (trimmed, lower-cased) email address.
    pub email: String,
    pub username: Option<String>,
}

/// A time-boxed offer to move a ticket to another user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub event_id: EventId,
    pub ticket_id: TicketId,
    pub from_owner_id: UserId,
    pub recipient: Recipient,
    /// Hex SHA-256 of the raw claim token.
    pub claim_token_hash: String,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub claimed_by_user_id: Option<UserId>,
    pub claimed_ticket_id: Option<TicketId>,
    pub cancelled_by: Option<String>,
}

impl Transfer {
    /// Returns true if the claim window has closed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Lifecycle of a fulfillment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfillmentStatus {
    Processing,
    Completed,
    Failed,
}

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::Processing => "processing",
            FulfillmentStatus::Completed => "completed",
            FulfillmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(FulfillmentStatus::Processing),
            "completed" => Some(FulfillmentStatus::Completed),
            "failed" => Some(FulfillmentStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a ticket created by a fulfillment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    pub event_id: EventId,
    pub ticket_id: TicketId,
    pub owner_id: UserId,
    pub quantity: u32,
}

/// Failure of one issue request inside a fulfillment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Position of the request in the settled list.
    pub index: usize,
    pub kind: String,
    pub message: String,
}

/// Idempotency record tying one payment/order to the tickets it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub key: FulfillmentKey,
    pub status: FulfillmentStatus,
    pub created_ticket_refs: Vec<TicketRef>,
    pub errors: Vec<ItemError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Fulfillment {
    /// A fresh record claiming `key`.
    pub fn processing(key: FulfillmentKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status: FulfillmentStatus::Processing,
            created_ticket_refs: Vec::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Denormalized per-(event, user) totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventUserSummary {
    pub event_id: EventId,
    pub user_id: UserId,
    pub total_tickets: i64,
    pub used_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl EventUserSummary {
    pub fn empty(event_id: EventId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            event_id,
            user_id,
            total_tickets: 0,
            used_count: 0,
            updated_at: now,
        }
    }

    /// Returns true if both counters equal the other summary's counters.
    pub fn same_totals(&self, other: &EventUserSummary) -> bool {
        self.total_tickets == other.total_tickets && self.used_count == other.used_count
    }
}

/// A summary overwrite guarded by the counters the writer compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryWrite {
    pub summary: EventUserSummary,
    /// Stored row the new counters were computed against, `None` when no
    /// row existed.
    pub expected: Option<EventUserSummary>,
}

impl SummaryWrite {
    /// Returns true if `current` still holds the counters the writer saw.
    pub fn matches(&self, current: Option<&EventUserSummary>) -> bool {
        match (&self.expected, current) {
            (None, None) => true,
            (Some(expected), Some(current)) => expected.same_totals(current),
            _ => false,
        }
    }
}

/// Atomic increment applied to a summary at commit time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryDelta {
    pub total_tickets: i64,
    pub used_count: i64,
}

impl SummaryDelta {
    pub fn tickets(quantity: u32) -> Self {
        Self {
            total_tickets: i64::from(quantity),
            used_count: 0,
        }
    }

    pub fn one_use() -> Self {
        Self {
            total_tickets: 0,
            used_count: 1,
        }
    }

    pub fn negate(self) -> Self {
        Self {
            total_tickets: -self.total_tickets,
            used_count: -self.used_count,
        }
    }
}
