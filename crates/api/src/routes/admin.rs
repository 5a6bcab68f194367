//! Operator endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use common::EventId;
use ledger_store::LedgerStore;
use reconciliation::{ReconcileOptions, ReconcileReport};
use serde::Deserialize;

use crate::AppState;
use crate::caller::Caller;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    #[serde(default)]
    pub dry_run: bool,
}

/// POST /admin/reconcile/{event_id}?dry_run=
///
/// Not bounded by the request timeout: a large event may take longer, and
/// reconciliation is safe to interrupt and rerun.
#[tracing::instrument(skip(state, caller))]
pub async fn reconcile<S: LedgerStore + ?Sized + 'static>(
    State(state): State<Arc<AppState<S>>>,
    caller: Caller,
    Path(event_id): Path<EventId>,
    Query(query): Query<ReconcileQuery>,
) -> Result<Json<ReconcileReport>, ApiError> {
    caller.require_admin()?;
    let report = state
        .reconciler
        .reconcile(
            event_id,
            ReconcileOptions {
                dry_run: query.dry_run,
            },
        )
        .await?;
    Ok(Json(report))
}
