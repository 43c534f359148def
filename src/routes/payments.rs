//! Payment route definitions

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::*;
use crate::state::AppState;

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/api/payments", post(create_payment))
        .route("/api/payments/:id", get(get_payment))
        .route("/api/payments/:id/confirm", post(confirm_payment))
        .route("/api/payments/:id/fail", post(fail_payment))
        .route("/api/payments/:id/release", post(release_payment))
        .route("/api/payments/:id/refund", post(refund_payment))
}
