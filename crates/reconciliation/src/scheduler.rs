//! Periodic reconciliation.

use std::time::Duration;

use ledger_store::LedgerStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::reconciler::{ReconcileOptions, Reconciler};

/// Runs [`Reconciler::reconcile_all`] on a fixed interval until shut down.
///
/// The first run happens one interval after start.
pub struct ReconcileScheduler<S: LedgerStore + ?Sized> {
    reconciler: Reconciler<S>,
    interval: Duration,
}

impl<S: LedgerStore + ?Sized + 'static> ReconcileScheduler<S> {
    pub fn new(reconciler: Reconciler<S>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    /// Spawns the loop onto the current runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "reconcile scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("reconcile scheduler stopped");
    }

    /// Runs one pass over every event. Returns the number of rows updated.
    pub async fn run_once(&self) -> usize {
        metrics::counter!("reconcile_runs_total").increment(1);
        match self.reconciler.reconcile_all(ReconcileOptions::default()).await {
            Ok(reports) => {
                let updated = reports.iter().map(|r| r.updated).sum();
                tracing::info!(events = reports.len(), updated, "scheduled reconciliation done");
                updated
            }
            Err(e) => {
                metrics::counter!("reconcile_failures_total").increment(1);
                tracing::warn!(error = %e, "scheduled reconciliation failed");
                0
            }
        }
    }
}
