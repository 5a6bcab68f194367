//! External collaborator traits and in-memory implementations for transfers.

pub mod notifier;
pub mod rate_limiter;

pub use notifier::{InMemoryNotifier, Notification, TracingNotifier, TransferNotifier};
pub use rate_limiter::{InMemoryRateLimiter, RateDecision, RateLimiter};
