//! Summary reconciliation for the ticket ledger.
//!
//! Live summaries are maintained with counter increments, which can drift
//! if a writer crashes between steps or a row is edited by hand. This crate
//! recomputes them from the tickets themselves:
//! - [`fold_tickets`] derives the expected totals for one event
//! - [`Reconciler`] compares them with stored rows and writes the difference
//! - [`ReconcileScheduler`] runs the reconciler for every event on an interval

pub mod error;
pub mod fold;
pub mod reconciler;
pub mod scheduler;

pub use error::{ReconcileError, Result};
pub use fold::{Totals, fold_tickets};
pub use reconciler::{ReconcileOptions, ReconcileReport, Reconciler, SummaryChange};
pub use scheduler::ReconcileScheduler;
