//! HTTP handlers, one module per resource.

pub mod admin;
pub mod fulfillments;
pub mod health;
pub mod metrics;
pub mod scan;
pub mod transfers;

use std::future::Future;
use std::time::Duration;

use crate::error::ApiError;

/// Bounds a ledger call by the request timeout.
///
/// The call may still commit after the timeout fires; callers are told to
/// re-query rather than blindly retry. Settlements keep running to completion
/// on their own task once the timeout drops the wait.
pub(crate) async fn bounded<T, E>(
    limit: Duration,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T, ApiError>
where
    ApiError: From<E>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => {
            ::metrics::counter!("http_request_timeouts_total").increment(1);
            tracing::warn!(timeout_ms = limit.as_millis() as u64, "ledger call timed out");
            Err(ApiError::Timeout)
        }
    }
}
