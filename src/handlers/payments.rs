//! Payment and escrow release handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::escrow::{CreatePaymentRequest, FailChargeRequest, Payment, PaymentWithPayouts, Payout};
use crate::models::ApiResponse;
use crate::state::AppState;

/// Create a PENDING payment for a booking
pub async fn create_payment(
    State(app_state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Payment>>)> {
    let payment = app_state.ledger.create_payment(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(payment))))
}

/// Get a payment together with its payouts
pub async fn get_payment(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<PaymentWithPayouts>>> {
    let payment = app_state.ledger.payment_with_payouts(id).await?;
    Ok(Json(ApiResponse::ok(payment)))
}

/// Mark the charge as confirmed, moving the funds into escrow
pub async fn confirm_payment(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Payment>>> {
    let payment = app_state.ledger.confirm_charge(id).await?;
    Ok(Json(ApiResponse::ok(payment)))
}

pub async fn fail_payment(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<FailChargeRequest>>,
) -> ApiResult<Json<ApiResponse<Payment>>> {
    let reason = body
        .and_then(|Json(request)| request.reason)
        .unwrap_or_else(|| "charge failed".to_string());

    let payment = app_state.ledger.fail_charge(id, &reason).await?;
    Ok(Json(ApiResponse::ok(payment)))
}

/// Request the escrow release. The first transfer attempt runs in the
/// background, so the payout is returned while still PENDING.
pub async fn release_payment(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Payout>>)> {
    let payout = app_state.ledger.request_release(id).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::ok(payout))))
}

pub async fn refund_payment(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Payment>>> {
    let payment = app_state.ledger.refund(id).await?;
    Ok(Json(ApiResponse::ok(payment)))
}
