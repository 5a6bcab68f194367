//! Transfer state machine.

use chrono::{DateTime, Utc};
use ledger_store::{Transfer, TransferStatus};
use serde::{Deserialize, Serialize};

/// The status a transfer presents to callers.
///
/// `Expired` is never stored; it is derived when a pending transfer is read
/// after its deadline.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Claimed
///           ├──► Cancelled
///           └──► Expired (time passes)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveStatus {
    Pending,
    Claimed,
    Cancelled,
    Expired,
}

impl EffectiveStatus {
    /// Derives the effective status of `transfer` at `now`.
    pub fn of(transfer: &Transfer, now: DateTime<Utc>) -> Self {
        match transfer.status {
            TransferStatus::Claimed => EffectiveStatus::Claimed,
            TransferStatus::Cancelled => EffectiveStatus::Cancelled,
            TransferStatus::Pending if transfer.is_expired_at(now) => EffectiveStatus::Expired,
            TransferStatus::Pending => EffectiveStatus::Pending,
        }
    }

    /// Returns true if the transfer can still be claimed.
    pub fn can_claim(&self) -> bool {
        matches!(self, EffectiveStatus::Pending)
    }

    /// Returns true if the transfer blocks a new transfer of the same ticket.
    pub fn blocks_new_transfer(&self) -> bool {
        matches!(self, EffectiveStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveStatus::Pending => "pending",
            EffectiveStatus::Claimed => "claimed",
            EffectiveStatus::Cancelled => "cancelled",
            EffectiveStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for EffectiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use common::{EventId, TicketId, TransferId};
    use ledger_store::Recipient;

    use super::*;

    fn transfer(status: TransferStatus, expires_in: Duration) -> Transfer {
        let now = Utc::now();
        Transfer {
            id: TransferId::new(),
            event_id: EventId::new(),
            ticket_id: TicketId::new(),
            from_owner_id: "alice".into(),
            recipient: Recipient {
                user_id: None,
                email: "b@x.com".into(),
                username: None,
            },
            claim_token_hash: "hash".into(),
            status,
            created_at: now,
            expires_at: now + expires_in,
            claimed_by_user_id: None,
            claimed_ticket_id: None,
            cancelled_by: None,
        }
    }

    #[test]
    fn pending_before_deadline_is_claimable() {
        let t = transfer(TransferStatus::Pending, Duration::hours(1));
        let status = EffectiveStatus::of(&t, Utc::now());
        assert_eq!(status, EffectiveStatus::Pending);
        assert!(status.can_claim());
        assert!(status.blocks_new_transfer());
    }

    #[test]
    fn pending_after_deadline_is_expired() {
        let t = transfer(TransferStatus::Pending, Duration::hours(-1));
        let status = EffectiveStatus::of(&t, Utc::now());
        assert_eq!(status, EffectiveStatus::Expired);
        assert!(!status.can_claim());
        assert!(!status.blocks_new_transfer());
    }

    #[test]
    fn stored_terminal_states_win_over_expiry() {
        let t = transfer(TransferStatus::Claimed, Duration::hours(-1));
        let status = EffectiveStatus::of(&t, Utc::now());
        assert_eq!(status, EffectiveStatus::Claimed);
        assert!(!status.can_claim());

        let t = transfer(TransferStatus::Cancelled, Duration::hours(1));
        assert_eq!(
            EffectiveStatus::of(&t, Utc::now()),
            EffectiveStatus::Cancelled
        );
    }
}
