//! Idempotent order settlement.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{EventId, FulfillmentKey, UserId};
use ledger::{FulfillmentResult, IssueRequest, LedgerError};
use ledger_store::{Fulfillment, LedgerStore};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::bounded;

#[derive(Deserialize)]
pub struct SettleRequest {
    /// Order or payment identifier, stable across retries.
    pub key: String,
    #[serde(default)]
    pub items: Vec<SettleItem>,
}

#[derive(Deserialize)]
pub struct SettleItem {
    pub event_id: EventId,
    pub owner_id: String,
    pub quantity: u32,
}

impl From<SettleItem> for IssueRequest {
    fn from(item: SettleItem) -> Self {
        IssueRequest::new(item.event_id, UserId::new(item.owner_id), item.quantity)
    }
}

/// POST /fulfillments: issue tickets for a paid order exactly once.
///
/// Responds 201 on first settlement and 200 when replaying a recorded one.
#[tracing::instrument(skip(state, req), fields(key = %req.key))]
pub async fn settle<S: LedgerStore + ?Sized + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<SettleRequest>,
) -> Result<(StatusCode, Json<FulfillmentResult>), ApiError> {
    let items: Vec<IssueRequest> = req.items.into_iter().map(IssueRequest::from).collect();
    let result = bounded(
        state.request_timeout,
        state.guard.settle(FulfillmentKey::new(req.key), items),
    )
    .await?;

    let status = if result.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(result)))
}

/// GET /fulfillments/{key}: the recorded outcome of a settlement.
#[tracing::instrument(skip(state))]
pub async fn get<S: LedgerStore + ?Sized + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(key): Path<String>,
) -> Result<Json<Fulfillment>, ApiError> {
    let key = FulfillmentKey::new(key);
    let fulfillment = bounded(state.request_timeout, state.guard.get(&key))
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("fulfillment {}", key.as_str())))?;
    Ok(Json(fulfillment))
}
