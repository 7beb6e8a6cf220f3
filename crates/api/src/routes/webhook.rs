//! Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{error::ApiError, state::AppState};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// `POST /webhook` takes the raw body so the signature covers the exact bytes
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let event = match state.billing.webhooks.verify_event(&body, signature) {
        Ok(event) => event,
        Err(e) => return ApiError::from(e).into_response(),
    };

    tracing::info!(event_id = %event.id, event_type = %event.type_, "Webhook received");

    match state.billing.webhooks.handle_event(&event).await {
        Ok(_) => Json(json!({ "received": true })).into_response(),
        Err(e) => {
            tracing::error!(event_id = %event.id, event_type = %event.type_, error = %e, "Error handling event");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}
