//! Ticket transfer endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{TicketId, TransferId, UserId};
use ledger_store::{LedgerStore, Recipient, Ticket, Transfer};
use serde::Deserialize;
use transfer::{CreatedTransfer, TransferView};

use crate::AppState;
use crate::caller::Caller;
use crate::error::ApiError;
use crate::routes::bounded;

#[derive(Deserialize)]
pub struct CreateTransferRequest {
    pub ticket_id: TicketId,
    pub to_email: String,
    pub to_user_id: Option<String>,
    pub to_username: Option<String>,
}

#[derive(Deserialize)]
pub struct ClaimTransferRequest {
    pub claim_token: String,
}

/// POST /transfers: offer the caller's ticket to a recipient.
///
/// The raw claim token appears only in this response.
#[tracing::instrument(skip(state, caller, req), fields(ticket_id = %req.ticket_id))]
pub async fn create<S: LedgerStore + ?Sized + 'static>(
    State(state): State<Arc<AppState<S>>>,
    caller: Caller,
    Json(req): Json<CreateTransferRequest>,
) -> Result<(StatusCode, Json<CreatedTransfer>), ApiError> {
    let owner_id = caller.require_user()?;
    let recipient = Recipient {
        user_id: req.to_user_id.map(UserId::new),
        email: req.to_email,
        username: req.to_username,
    };

    let created = bounded(
        state.request_timeout,
        state.transfers.create(req.ticket_id, owner_id, recipient),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /transfers/claim: redeem a claim token for a fresh ticket.
#[tracing::instrument(skip(state, caller, req))]
pub async fn claim<S: LedgerStore + ?Sized + 'static>(
    State(state): State<Arc<AppState<S>>>,
    caller: Caller,
    Json(req): Json<ClaimTransferRequest>,
) -> Result<Json<Ticket>, ApiError> {
    let claimer = caller.claimer()?;
    if req.claim_token.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "claim_token must not be empty".to_string(),
        ));
    }

    let ticket = bounded(
        state.request_timeout,
        state.transfers.claim(req.claim_token.trim(), claimer),
    )
    .await?;
    Ok(Json(ticket))
}

/// POST /transfers/{id}/cancel: withdraw a pending transfer.
#[tracing::instrument(skip(state, caller))]
pub async fn cancel<S: LedgerStore + ?Sized + 'static>(
    State(state): State<Arc<AppState<S>>>,
    caller: Caller,
    Path(id): Path<TransferId>,
) -> Result<Json<Transfer>, ApiError> {
    let requester = caller.requester()?;
    let transfer = bounded(state.request_timeout, state.transfers.cancel(id, requester)).await?;
    Ok(Json(transfer))
}

/// GET /transfers/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: LedgerStore + ?Sized + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<TransferId>,
) -> Result<Json<TransferView>, ApiError> {
    let view = bounded(state.request_timeout, state.transfers.get(id)).await?;
    Ok(Json(view))
}
