//! API error types with HTTP response mapping.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use ledger::{ErrorKind, LedgerError};
use reconciliation::ReconcileError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
///
/// Every response body is `{"error": <message>, "kind": <kind>}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Ledger, fulfillment, or transfer failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),

    /// Caller identity headers are missing.
    #[error("{0}")]
    Unauthorized(String),

    /// The caller lacks the administrative flag.
    #[error("{0}")]
    Forbidden(String),

    /// The ledger call did not finish within the request timeout. The
    /// outcome is unknown, so the client must re-query before retrying.
    #[error("request timed out")]
    Timeout,
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Ledger(err) => (ledger_status(err.kind()), err.kind().as_str()),
            ApiError::Reconcile(ReconcileError::EventNotFound(_)) => {
                (StatusCode::NOT_FOUND, ErrorKind::NotFound.as_str())
            }
            ApiError::Reconcile(ReconcileError::Store(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::TransientStorage.as_str(),
            ),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, ErrorKind::InvalidInput.as_str()),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, ErrorKind::Forbidden.as_str()),
            ApiError::Timeout => (StatusCode::SERVICE_UNAVAILABLE, "timeout"),
        }
    }
}

fn ledger_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyUsed
        | ErrorKind::Exhausted
        | ErrorKind::Conflict
        | ErrorKind::WrongEvent => StatusCode::CONFLICT,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Expired => StatusCode::GONE,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::TransientStorage => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(error = %message, kind, "request failed");
        } else {
            tracing::debug!(error = %message, kind, "request rejected");
        }

        let body = serde_json::json!({ "error": message, "kind": kind });
        let mut response = (status, axum::Json(body)).into_response();

        if let ApiError::Ledger(LedgerError::RateLimited { retry_after_secs }) = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}
