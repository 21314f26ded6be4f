//! Courier API server binary entrypoint.
//!
//! Exits non-zero if the database or the SMTP relay is unreachable at startup.

use std::sync::Arc;

use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::db::{create_pool, run_migrations};
use courier_engine::{DispatchEngine, PgRecordStore, RetryPolicy, RetryScheduler};
use courier_notifier::SmtpTransport;

use courier_api::routes::create_router;
use courier_api::state::AppState;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 256 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; LOG_FORMAT=json for structured output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("courier_api=debug,courier_engine=debug,courier_notifier=info,tower_http=debug")
    });
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting Courier notification service...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Record store
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    let store = Arc::new(PgRecordStore::new(pool));

    // Transport
    let transport = SmtpTransport::new(&config.smtp)?;
    transport.verify().await?;

    let engine = DispatchEngine::new(
        store,
        Arc::new(transport),
        RetryPolicy::from(&config.dispatch),
        config.smtp.timeout,
    );

    // Retry scheduler
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = RetryScheduler::new(engine.clone(), &config.dispatch);
    let scheduler_handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    // Build router
    let app = create_router(AppState::new(engine))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    // Start server
    tracing::info!("API server listening on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown_tx.send(true).ok();
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Retry scheduler task failed");
    }

    tracing::info!("Courier notification service stopped.");
    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on unix (container stop).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
