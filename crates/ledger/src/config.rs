//! Ledger service settings.

use ledger_store::RetryPolicy;

/// Settings shared by [`crate::TicketLedger`] and [`crate::FulfillmentGuard`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerConfig {
    /// Retry budget for transactions that hit write conflicts.
    pub retry: RetryPolicy,
}

impl LedgerConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.retry = self.retry.with_max_attempts(attempts);
        self
    }
}
