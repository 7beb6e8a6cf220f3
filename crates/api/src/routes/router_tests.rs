//! Router tests against the fake Stripe gateway and in-memory sheets

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use greens_billing::fake::FakeStripe;
use greens_billing::webhooks::signature_header;
use greens_billing::{BillingService, BillingSettings};
use greens_shared::{InMemorySheets, Ledger};

use super::{create_router, HEALTH_TEXT};
use crate::config::{Config, SheetsBackend};
use crate::state::AppState;

const WEBHOOK_SECRET: &str = "whsec_router_test";
const WEEKLY: &str = "price_weekly";

struct TestApp {
    router: Router,
    stripe: Arc<FakeStripe>,
    sheets: Arc<InMemorySheets>,
}

async fn app() -> TestApp {
    let sheets = Arc::new(InMemorySheets::new());
    sheets
        .seed("Customers", vec![vec!["Customer_ID", "Created_At", "Email"]])
        .await;
    sheets.seed("Addresses", vec![vec!["Address_ID"]]).await;
    sheets.seed("Payments", vec![vec!["Payment_ID"]]).await;

    let stripe = Arc::new(FakeStripe::new());
    stripe
        .add_product(json!({
            "id": "prod_weekly",
            "name": "Single Nutrition Mix",
            "images": ["https://files.stripe.com/links/abc"]
        }))
        .await;
    stripe
        .add_price(json!({
            "id": WEEKLY, "active": true, "type": "recurring", "currency": "usd",
            "unit_amount": 3499, "product": "prod_weekly",
            "recurring": {"interval": "week", "interval_count": 1}
        }))
        .await;
    stripe
        .add_price(json!({
            "id": "price_hidden", "active": true, "type": "one_time", "currency": "usd",
            "unit_amount": 100, "product": "prod_weekly"
        }))
        .await;

    let billing = BillingService::new(
        stripe.clone(),
        Ledger::new(sheets.clone()),
        BillingSettings {
            webhook_secret: WEBHOOK_SECRET.to_string(),
            allowed_price_ids: vec![WEEKLY.to_string()],
            public_base_url: "http://localhost:4242".to_string(),
        },
    );

    TestApp {
        router: create_router(AppState::new(billing)),
        stripe,
        sheets,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// =============================================================================
// Health and catalog
// =============================================================================

#[tokio::test]
async fn test_health() {
    let app = app().await;
    let (status, body) = send(&app.router, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), HEALTH_TEXT);
}

#[tokio::test]
async fn test_products_lists_allowed_prices_uncached() {
    let app = app().await;
    let response = app.router.clone().oneshot(get("/products")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let products = json_body(&body);
    let products = products.as_array().unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0]["id"], WEEKLY);
    assert_eq!(products[0]["type"], "recurring");
    assert_eq!(products[0]["price"], 34.99);
    assert!(products[0]["image"]
        .as_str()
        .unwrap()
        .starts_with("http://localhost:4242/product-image?url="));
}

#[tokio::test]
async fn test_products_failure() {
    let app = app().await;
    app.stripe.fail("list_prices").await;

    let (status, body) = send(&app.router, get("/products")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(&body), json!({"error": "Failed to fetch products"}));
}

#[tokio::test]
async fn test_product_image_requires_stripe_url() {
    let app = app().await;

    let (status, body) = send(&app.router, get("/product-image")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(String::from_utf8(body).unwrap(), "URL is required");

    let (status, _) = send(
        &app.router,
        get("/product-image?url=http%3A%2F%2F169.254.169.254%2Flatest"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// Discounts, leads and lookups
// =============================================================================

#[tokio::test]
async fn test_validate_discount_without_code() {
    let app = app().await;
    let (status, body) = send(&app.router, post_json("/validate-discount", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({"valid": false, "error": "Code is required"}));
}

#[tokio::test]
async fn test_validate_discount_unknown_code() {
    let app = app().await;
    let (_, body) = send(
        &app.router,
        post_json("/validate-discount", json!({"code": "nope", "orderTotal": "40"})),
    )
    .await;
    assert_eq!(json_body(&body)["error"], "Invalid discount code");
}

#[tokio::test]
async fn test_check_email_requires_email() {
    let app = app().await;
    let (status, body) = send(&app.router, get("/check-email")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body), json!({"error": "Email is required"}));
}

#[tokio::test]
async fn test_capture_lead_then_check_email() {
    let app = app().await;
    let lead = json!({
        "email": "jane@example.com",
        "firstName": "jane",
        "lastName": "doe",
        "address": "1 main st",
        "city": "las vegas",
        "state": "nv",
        "zip": "89101",
        "sameAsShipping": true
    });

    let (status, body) = send(&app.router, post_json("/capture-lead", lead)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json_body(&body),
        json!({"success": true, "customerId": "CUS_00001", "isNew": true})
    );

    let (status, body) = send(&app.router, get("/check-email?email=JANE%40example.com")).await;
    assert_eq!(status, StatusCode::OK);
    let lookup = json_body(&body);
    assert_eq!(lookup["exists"], true);
    assert_eq!(lookup["customer"]["firstName"], "Jane");
    assert_eq!(lookup["customer"]["shippingAddressId"], "ADDR_00001");
}

#[tokio::test]
async fn test_capture_lead_requires_email() {
    let app = app().await;
    let (status, body) = send(&app.router, post_json("/capture-lead", json!({"firstName": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body), json!({"error": "Email is required"}));
}

// =============================================================================
// Checkout
// =============================================================================

#[tokio::test]
async fn test_create_subscription_validation() {
    let app = app().await;
    let (status, body) = send(
        &app.router,
        post_json("/create-subscription", json!({"email": "a@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body), json!({"error": "priceId is required"}));
}

#[tokio::test]
async fn test_create_recurring_subscription() {
    let app = app().await;
    let (status, body) = send(
        &app.router,
        post_json(
            "/create-subscription",
            json!({"priceId": WEEKLY, "email": "a@example.com", "delivery": {"firstName": "A"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let response = json_body(&body);
    assert_eq!(response["type"], "recurring");
    assert!(response["clientSecret"].as_str().unwrap().ends_with("_secret"));
    assert!(response["subscriptionId"].is_string());
    assert!(response.get("paymentIntentId").is_none());
}

#[tokio::test]
async fn test_create_subscription_stripe_failure_is_internal_error() {
    let app = app().await;
    app.stripe.fail("create_customer").await;

    let (status, body) = send(
        &app.router,
        post_json("/create-subscription", json!({"priceId": WEEKLY, "email": "a@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(&body), json!({"error": "Internal server error"}));
}

// =============================================================================
// Webhook
// =============================================================================

fn webhook_request(payload: &str, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .header("stripe-signature", signature)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let app = app().await;
    let payload = json!({"id": "evt_1", "type": "ping", "data": {"object": {}}}).to_string();
    let signature = signature_header("whsec_wrong", &payload, now());

    let (status, body) = send(&app.router, webhook_request(&payload, &signature)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8(body).unwrap().starts_with("Webhook Error: "));
}

#[tokio::test]
async fn test_webhook_records_refund() {
    let app = app().await;
    let payload = json!({
        "id": "evt_refund",
        "type": "charge.refunded",
        "created": now(),
        "data": {"object": {
            "id": "ch_1", "amount": 3499, "amount_refunded": 3499, "currency": "usd"
        }}
    })
    .to_string();
    let signature = signature_header(WEBHOOK_SECRET, &payload, now());

    let (status, body) = send(&app.router, webhook_request(&payload, &signature)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({"received": true}));

    let payments = app.sheets.rows("Payments").await;
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[1][7], "Refunded");
}

// =============================================================================
// Google Sheets wiring
// =============================================================================

#[tokio::test]
async fn test_google_backend_reads_through_sheets_api() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v4/spreadsheets/sheet-123/values/Customers!C:C")
        .match_header("authorization", "Bearer test-token")
        .with_status(200)
        .with_body(json!({"values": [["Email"], ["someone@example.com"]]}).to_string())
        .create_async()
        .await;

    let config = Config {
        port: 4242,
        bind_address: "127.0.0.1:0".to_string(),
        client_url: "http://localhost:5173".to_string(),
        public_base_url: "http://localhost:4242".to_string(),
        stripe_secret_key: "sk_test_123".to_string(),
        stripe_webhook_secret: WEBHOOK_SECRET.to_string(),
        allowed_price_ids: vec![WEEKLY.to_string()],
        sheets_backend: SheetsBackend::Google,
        spreadsheet_id: "sheet-123".to_string(),
        google_credentials_path: "missing.json".to_string(),
        sheets_access_token: Some("test-token".to_string()),
        sheets_api_base_url: Some(server.url()),
        reference_cache_ttl: Duration::from_secs(60),
    };
    let router = create_router(AppState::from_config(&config).unwrap());

    let (status, body) = send(&router, get("/check-email?email=nobody%40example.com")).await;

    mock.assert_async().await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body), json!({"exists": false}));
}
