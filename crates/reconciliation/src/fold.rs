//! Folding tickets into per-owner totals.

use std::collections::BTreeMap;

use common::UserId;
use ledger_store::{EventUserSummary, Ticket};
use serde::{Deserialize, Serialize};

/// Summary counters for one (event, user) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total_tickets: i64,
    pub used_count: i64,
}

impl Totals {
    pub fn of(summary: &EventUserSummary) -> Self {
        Self {
            total_tickets: summary.total_tickets,
            used_count: summary.used_count,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_tickets == 0 && self.used_count == 0
    }
}

/// Sums quantity and usage per owner, skipping transferred tickets.
///
/// A transferred ticket's admissions belong to the ticket that replaced it,
/// which carries its own owner.
pub fn fold_tickets<'a>(tickets: impl IntoIterator<Item = &'a Ticket>) -> BTreeMap<UserId, Totals> {
    let mut totals: BTreeMap<UserId, Totals> = BTreeMap::new();
    for ticket in tickets {
        if ticket.is_transferred() {
            continue;
        }
        let entry = totals.entry(ticket.owner_id.clone()).or_default();
        entry.total_tickets += i64::from(ticket.quantity);
        entry.used_count += i64::from(ticket.used_count);
    }
    totals
}
