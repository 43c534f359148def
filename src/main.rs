//! Marketplace escrow server
//!
//! Holds booking payments in escrow, pays providers out through the payment
//! processor, retries failed transfers and reconciles processor webhooks.

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};

use marketplace_escrow_server::config::{Config, StoreBackend};
use marketplace_escrow_server::db;
use marketplace_escrow_server::escrow::{
    LedgerSettings, LedgerStore, MemoryLedgerStore, PgLedgerStore,
};
use marketplace_escrow_server::gateway::PaystackGateway;
use marketplace_escrow_server::routes;
use marketplace_escrow_server::state::{AppState, ServiceSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!(
        environment = config.environment.as_str(),
        store = ?config.store_backend,
        "Starting escrow server"
    );

    let store: Arc<dyn LedgerStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config)
                .await
                .context("Failed to connect to database")?;
            db::run_migrations(&pool).await?;
            db::check_health(&pool).await?;
            Arc::new(PgLedgerStore::new(pool))
        }
        StoreBackend::Memory => {
            if config.environment.is_production() {
                tracing::warn!("In-memory ledger store in production: records are lost on restart");
            }
            Arc::new(MemoryLedgerStore::new())
        }
    };

    let gateway =
        Arc::new(PaystackGateway::new(config.paystack()).context("Failed to build gateway client")?);

    let (app_state, retry_rx) = AppState::assemble(
        store,
        gateway,
        ServiceSettings {
            ledger: LedgerSettings {
                policy: config.retry_policy(),
                fee_percent: config.platform_fee_percent,
                default_currency: config.default_currency.clone(),
                webhook_claim_lease: config.webhook_claim_lease,
            },
            gateway_timeout: config.gateway_timeout,
            webhook_secret: config.webhook_secret.clone(),
        },
    );

    // Start the retry coordinator, then re-arm retries persisted before a restart
    let coordinator = app_state.coordinator.clone();
    tokio::spawn(async move {
        coordinator.run(retry_rx).await;
        tracing::error!("Retry coordinator task exited unexpectedly");
    });

    match app_state.coordinator.recover().await {
        Ok(count) => tracing::info!(count, "Pending payouts rescheduled"),
        Err(e) => tracing::error!(error = %e, "Failed to recover pending payouts"),
    }

    let app = routes::app_router(app_state).layer(configure_cors(&config));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    tracing::info!("Server listening on {}", addr);
    tracing::info!("WebSocket available at ws://{}/ws", addr);
    tracing::info!("Health check at http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn configure_cors(config: &Config) -> CorsLayer {
    let allowed_origins_str = config.cors_allowed_origins.clone().unwrap_or_default();

    if allowed_origins_str.is_empty() {
        tracing::warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (permissive)");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins_str
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
