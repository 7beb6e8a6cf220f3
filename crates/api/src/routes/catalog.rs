//! Product catalog and image proxy

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use greens_billing::catalog::is_stripe_file_url;

use crate::state::AppState;

const DEFAULT_IMAGE_TYPE: &str = "image/jpeg";
const IMAGE_CACHE_CONTROL: &str = "public, max-age=86400";

/// `GET /products`
pub async fn list_products(State(state): State<AppState>) -> Response {
    match state.billing.catalog.list_products().await {
        Ok(products) => (
            [(header::CACHE_CONTROL, "no-store")],
            Json(products),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to fetch products");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to fetch products" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: Option<String>,
}

/// `GET /product-image?url=` proxies Stripe-hosted product images
pub async fn product_image(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> Response {
    let Some(url) = query.url.filter(|u| !u.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "URL is required").into_response();
    };
    if !is_stripe_file_url(&url) {
        tracing::warn!(url = %url, "Refusing to proxy image from another host");
        return (StatusCode::BAD_REQUEST, "Only Stripe file URLs can be proxied").into_response();
    }

    match fetch_image(&state.http_client, &url).await {
        Ok((content_type, bytes)) => (
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, IMAGE_CACHE_CONTROL.to_string()),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(url = %url, error = %e, "Error proxying image");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to proxy image: {}", e),
            )
                .into_response()
        }
    }
}

async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
) -> Result<(String, axum::body::Bytes), reqwest::Error> {
    let response = client.get(url).send().await?.error_for_status()?;
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_IMAGE_TYPE)
        .to_string();
    let bytes = response.bytes().await?;
    Ok((content_type, bytes))
}
