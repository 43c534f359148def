//! Processor webhook endpoint

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::error::{ApiError, ApiResult};
use crate::models::{ApiResponse, WebhookAck};
use crate::state::AppState;
use crate::webhook::{verify_signature, RawWebhook, Reconciled, SignatureError, SIGNATURE_HEADER};

/// Verify, parse and reconcile one delivery.
///
/// Anything redelivery cannot fix is acknowledged with 200, including domain
/// errors; only infrastructure failures answer 500 so the processor retries.
pub async fn paystack_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ApiResponse<WebhookAck>>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match verify_signature(&body, signature, &app_state.webhook_secret) {
        Ok(()) => {}
        Err(SignatureError::NoSecret) => {
            // Fail-closed: if secret is not configured, reject all requests
            tracing::error!("Webhook secret not configured - rejecting request");
            return Err(ApiError::ServiceUnavailable(
                "Webhook endpoint is not configured".to_string(),
            ));
        }
        Err(err) => {
            tracing::warn!(error = %err, "Webhook signature rejected");
            return Err(ApiError::Unauthorized(err.to_string()));
        }
    }

    let raw = RawWebhook::from_slice(&body)?;
    let event_id = raw
        .event_id()
        .ok_or_else(|| ApiError::BadRequest("Webhook carries no event identifier".to_string()))?;

    match app_state
        .reconciler
        .handle(&event_id, &raw.event, &raw.data)
        .await
    {
        Ok(reconciled) => {
            let outcome = match reconciled {
                Reconciled::Applied(_) => "applied",
                Reconciled::PaymentConfirmed(_) => "payment_confirmed",
                Reconciled::Duplicate => "duplicate",
                Reconciled::Ignored(_) => "ignored",
            };

            Ok((
                StatusCode::OK,
                Json(ApiResponse::ok(WebhookAck {
                    event_id,
                    outcome: outcome.to_string(),
                })),
            ))
        }
        Err(err) if err.is_infrastructure() => Err(ApiError::InternalError(err.to_string())),
        Err(err) => Ok((
            StatusCode::OK,
            Json(ApiResponse {
                success: false,
                data: Some(WebhookAck {
                    event_id,
                    outcome: "rejected".to_string(),
                }),
                error: Some(err.to_string()),
            }),
        )),
    }
}
