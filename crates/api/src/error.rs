//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use greens_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// Rejected webhook signature or payload, answered as plain text
    #[error("Webhook Error: {0}")]
    Webhook(String),

    #[error(transparent)]
    Billing(BillingError),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid(msg) => ApiError::Webhook(msg),
            other => ApiError::Billing(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            ApiError::Webhook(msg) => {
                tracing::warn!(error = %msg, "Rejected webhook");
                (StatusCode::BAD_REQUEST, format!("Webhook Error: {}", msg)).into_response()
            }
            ApiError::Billing(e) => {
                tracing::error!(error = %e, "Billing error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_errors_map_to_status() {
        let bad: ApiError = BillingError::InvalidInput("email is required".into()).into();
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);

        let webhook: ApiError = BillingError::WebhookSignatureInvalid("nope".into()).into();
        assert_eq!(webhook.to_string(), "Webhook Error: nope");
        assert_eq!(webhook.into_response().status(), StatusCode::BAD_REQUEST);

        let stripe: ApiError = BillingError::StripeApi("down".into()).into();
        assert_eq!(
            stripe.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
