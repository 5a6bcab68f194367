//! HTTP API server with observability for the ticket ledger.
//!
//! Provides REST endpoints for settlement, admission scans, transfers, and
//! reconciliation, with structured logging (tracing) and Prometheus metrics.

pub mod caller;
pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use ledger::{Clock, FulfillmentGuard, SystemClock, TicketLedger};
use ledger_store::LedgerStore;
use metrics_exporter_prometheus::PrometheusHandle;
use reconciliation::Reconciler;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use transfer::{InMemoryRateLimiter, TracingNotifier, TransferWorkflow};

use config::Config;

/// Transfer workflow as wired into the server.
pub type Transfers<S> = TransferWorkflow<S, InMemoryRateLimiter, TracingNotifier>;

/// Shared application state accessible from all handlers.
pub struct AppState<S: LedgerStore + ?Sized> {
    pub store: Arc<S>,
    pub ledger: TicketLedger<S>,
    pub guard: FulfillmentGuard<S>,
    pub transfers: Transfers<S>,
    pub reconciler: Reconciler<S>,
    pub request_timeout: Duration,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: LedgerStore + ?Sized + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/fulfillments", post(routes::fulfillments::settle::<S>))
        .route("/fulfillments/{key}", get(routes::fulfillments::get::<S>))
        .route("/scan/token", post(routes::scan::by_token::<S>))
        .route("/scan/owner", post(routes::scan::by_owner::<S>))
        .route("/transfers", post(routes::transfers::create::<S>))
        .route("/transfers/claim", post(routes::transfers::claim::<S>))
        .route("/transfers/{id}", get(routes::transfers::get::<S>))
        .route("/transfers/{id}/cancel", post(routes::transfers::cancel::<S>))
        .route(
            "/admin/reconcile/{event_id}",
            post(routes::admin::reconcile::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state over `store` with the in-process rate
/// limiter and the logging notifier.
pub fn create_default_state<S: LedgerStore + ?Sized + 'static>(
    store: Arc<S>,
    config: &Config,
) -> Arc<AppState<S>> {
    let ledger_config = config.ledger_config();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let transfers = TransferWorkflow::with_clock(
        store.clone(),
        InMemoryRateLimiter::new(),
        TracingNotifier,
        clock.clone(),
        config.transfer_config(),
    );

    Arc::new(AppState {
        ledger: TicketLedger::with_clock(store.clone(), clock.clone(), ledger_config),
        guard: FulfillmentGuard::with_clock(store.clone(), clock, ledger_config),
        transfers,
        reconciler: Reconciler::new(store.clone()).with_batch_size(config.reconcile_batch_size),
        request_timeout: config.request_timeout,
        store,
    })
}
