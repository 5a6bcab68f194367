//! Admission scans at the door.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use common::{EventId, UserId};
use ledger::ConsumeResult;
use ledger_store::LedgerStore;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::bounded;

#[derive(Deserialize)]
pub struct TokenScanRequest {
    pub token: String,
    /// Event the scanner is admitting to; a token for another event is rejected.
    pub expected_event_id: Option<EventId>,
}

#[derive(Deserialize)]
pub struct OwnerScanRequest {
    pub event_id: EventId,
    pub owner_id: String,
}

/// POST /scan/token: consume one admission from the ticket behind a token.
#[tracing::instrument(skip(state, req))]
pub async fn by_token<S: LedgerStore + ?Sized + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<TokenScanRequest>,
) -> Result<Json<ConsumeResult>, ApiError> {
    if req.token.trim().is_empty() {
        return Err(ApiError::BadRequest("token must not be empty".to_string()));
    }
    let result = bounded(
        state.request_timeout,
        state
            .ledger
            .consume_by_token(req.token.trim(), req.expected_event_id),
    )
    .await?;
    Ok(Json(result))
}

/// POST /scan/owner: consume one admission from the owner's best ticket.
#[tracing::instrument(skip(state, req), fields(event_id = %req.event_id))]
pub async fn by_owner<S: LedgerStore + ?Sized + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<OwnerScanRequest>,
) -> Result<Json<ConsumeResult>, ApiError> {
    let owner_id = UserId::new(req.owner_id);
    let result = bounded(
        state.request_timeout,
        state.ledger.consume_by_owner(req.event_id, &owner_id),
    )
    .await?;
    Ok(Json(result))
}
