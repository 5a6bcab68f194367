//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use ledger_store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};
use reconciliation::ReconcileScheduler;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (pretty, json) = match config.log_format {
        LogFormat::Pretty => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .init();
}

/// Connects to PostgreSQL when `DATABASE_URL` is set, otherwise keeps
/// everything in memory.
async fn open_store(config: &Config) -> Arc<dyn LedgerStore> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using in-memory ledger store");
        return Arc::new(InMemoryLedgerStore::new());
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(url)
        .await
        .expect("failed to connect to PostgreSQL");
    let store = PostgresLedgerStore::new(pool);
    store
        .run_migrations()
        .await
        .expect("failed to run migrations");
    tracing::info!(
        max_connections = config.database_max_connections,
        "connected to PostgreSQL ledger store"
    );
    Arc::new(store)
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Open the store and build application state
    let store = open_store(&config).await;
    let state = api::create_default_state(store, &config);

    // 4. Start the reconciliation scheduler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if config.reconcile_interval.is_zero() {
        tracing::info!("reconcile scheduler disabled");
        None
    } else {
        let scheduler =
            ReconcileScheduler::new(state.reconciler.clone(), config.reconcile_interval);
        Some(scheduler.spawn(shutdown_rx))
    };

    // 5. Build the application
    let app = api::create_app(state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop background work
    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler
        && let Err(e) = handle.await
    {
        tracing::warn!(error = %e, "reconcile scheduler task failed");
    }

    tracing::info!("server shut down gracefully");
}
