//! Lead capture and returning-customer lookup

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use greens_billing::{EmailLookup, LeadCaptured, LeadRequest};

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct EmailQuery {
    pub email: Option<String>,
}

/// `GET /check-email?email=`
pub async fn check_email(
    State(state): State<AppState>,
    Query(query): Query<EmailQuery>,
) -> ApiResult<Json<EmailLookup>> {
    let lookup = state
        .billing
        .customers
        .check_email(query.email.as_deref())
        .await?;
    Ok(Json(lookup))
}

/// `POST /capture-lead`
pub async fn capture_lead(
    State(state): State<AppState>,
    Json(lead): Json<LeadRequest>,
) -> ApiResult<Json<LeadCaptured>> {
    let captured = state.billing.customers.capture_lead(lead).await?;
    Ok(Json(captured))
}
