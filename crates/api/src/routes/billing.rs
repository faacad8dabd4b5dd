//! Billing webhook ingress

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use echodeck_billing::BillingError;

use crate::error::ApiError;
use crate::state::AppState;

/// Stripe webhook endpoint.
///
/// Raw body plus the `stripe-signature` header. Returns 200 on successful or
/// idempotent-duplicate processing, 400 on signature or payload failure, and
/// 500 on internal failure so the provider redelivers.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| match e {
            BillingError::WebhookSignatureInvalid => {
                tracing::warn!("Stripe webhook signature verification failed");
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::InvalidPayload(detail) => ApiError::BadRequest(detail),
            other => ApiError::Internal(other.to_string()),
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    state
        .billing
        .webhooks
        .handle_event(event)
        .await
        .map_err(|e| ApiError::Internal(format!("Webhook handling error: {}", e)))?;

    Ok(StatusCode::OK)
}
