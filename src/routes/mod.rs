//! Route definitions for the escrow API

mod payments;
mod payouts;
mod webhooks;

use axum::{routing::get, Router};

use crate::handlers::health_check;
use crate::middleware;
use crate::state::AppState;
use crate::websocket;

pub use payments::payment_routes;
pub use payouts::payout_routes;
pub use webhooks::webhook_routes;

/// Complete application router with request tracing applied
pub fn app_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/ws", get(websocket::ws_handler))
        .merge(payment_routes())
        .merge(payout_routes())
        .merge(webhook_routes())
        .with_state(app_state)
        .layer(axum::middleware::from_fn(middleware::request_tracing))
}

async fn root() -> &'static str {
    "Marketplace Escrow API Server"
}
