//! Webhook route definitions

use axum::{routing::post, Router};

use crate::handlers::paystack_webhook;
use crate::state::AppState;

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/api/webhooks/paystack", post(paystack_webhook))
}
