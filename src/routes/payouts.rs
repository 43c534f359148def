//! Payout and recipient route definitions

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::handlers::*;
use crate::state::AppState;

pub fn payout_routes() -> Router<AppState> {
    Router::new()
        .route("/api/payouts/:id", get(get_payout))
        .route("/api/payouts/:id/halt", post(halt_payout))
        .route("/api/providers/:id/recipient", put(register_recipient))
}
