//! Checkout and discount validation

use axum::{extract::State, Json};
use serde::Deserialize;

use greens_billing::{CheckoutRequest, CheckoutResponse};
use greens_shared::DiscountValidation;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscountRequest {
    pub code: Option<String>,
    /// Number or numeric string
    pub order_total: Option<serde_json::Value>,
}

fn order_total(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `POST /validate-discount`
pub async fn validate_discount(
    State(state): State<AppState>,
    Json(request): Json<DiscountRequest>,
) -> Json<DiscountValidation> {
    let total = order_total(request.order_total.as_ref());
    Json(
        state
            .billing
            .validate_discount(request.code.as_deref(), total)
            .await,
    )
}

/// `POST /create-subscription`
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let response = state.billing.checkout.create(request).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_total_accepts_numbers_and_strings() {
        assert_eq!(order_total(Some(&json!(42.5))), Some(42.5));
        assert_eq!(order_total(Some(&json!("19.99"))), Some(19.99));
        assert_eq!(order_total(Some(&json!("abc"))), None);
        assert_eq!(order_total(None), None);
    }
}
