//! Ticket ownership transfers.
//!
//! A transfer moves a ticket from its owner to a recipient in three steps:
//! 1. The owner creates a pending transfer and receives a raw claim token
//! 2. The recipient presents the token to claim a fresh ticket
//! 3. Either side may stop the process: the owner cancels, or the window expires
//!
//! Rate limiting and notifications are external collaborators behind the
//! traits in [`services`].

pub mod error;
pub mod services;
pub mod state;
pub mod workflow;

pub use error::ServiceError;
pub use services::{
    InMemoryNotifier, InMemoryRateLimiter, Notification, RateDecision, RateLimiter,
    TracingNotifier, TransferNotifier,
};
pub use state::EffectiveStatus;
pub use workflow::{
    Claimer, CreatedTransfer, Requester, TransferConfig, TransferView, TransferWorkflow,
    normalize_email,
};
