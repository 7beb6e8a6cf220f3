//! HTTP routes

mod catalog;
mod checkout;
mod customers;
mod webhook;

#[cfg(test)]
mod router_tests;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub const HEALTH_TEXT: &str = "702Greens Stripe subscription backend is running ✅";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/products", get(catalog::list_products))
        .route("/product-image", get(catalog::product_image))
        .route("/validate-discount", post(checkout::validate_discount))
        .route("/create-subscription", post(checkout::create_subscription))
        .route("/check-email", get(customers::check_email))
        .route("/capture-lead", post(customers::capture_lead))
        .route("/webhook", post(webhook::stripe_webhook))
        .with_state(state)
}

async fn health() -> &'static str {
    HEALTH_TEXT
}
