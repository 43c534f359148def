//! Payout and payout destination handlers

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::escrow::{Payout, Recipient, RegisterRecipientRequest};
use crate::models::ApiResponse;
use crate::state::AppState;

pub async fn get_payout(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Payout>>> {
    let payout = app_state.ledger.get_payout(id).await?;
    Ok(Json(ApiResponse::ok(payout)))
}

/// Manual override: no further retries for this payout
pub async fn halt_payout(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Payout>>> {
    let payout = app_state.ledger.halt_retries(id).await?;

    if app_state.coordinator.cancel(id).await {
        tracing::info!(payout_id = %id, "Scheduled transfer attempt cancelled");
    }

    Ok(Json(ApiResponse::ok(payout)))
}

/// Register or replace a provider's bank destination
pub async fn register_recipient(
    State(app_state): State<AppState>,
    Path(provider_id): Path<Uuid>,
    Json(request): Json<RegisterRecipientRequest>,
) -> ApiResult<Json<ApiResponse<Recipient>>> {
    let recipient = app_state
        .ledger
        .register_recipient(provider_id, request)
        .await?;
    Ok(Json(ApiResponse::ok(recipient)))
}
