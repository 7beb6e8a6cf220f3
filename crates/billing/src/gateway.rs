//! The Stripe calls the storefront makes
//!
//! Services depend on [`StripeGateway`] rather than a concrete client so the
//! reconciliation flows can run against an in-memory fake in tests.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BillingResult;
use crate::models::{
    Address, Charge, Customer, Invoice, Metadata, PaymentIntent, Price, Product, Subscription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceType {
    Recurring,
    OneTime,
}

impl PriceType {
    pub fn as_str(self) -> &'static str {
        match self {
            PriceType::Recurring => "recurring",
            PriceType::OneTime => "one_time",
        }
    }
}

/// `POST /v1/customers`
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewCustomer {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutomaticPaymentMethods {
    pub enabled: bool,
}

/// `POST /v1/payment_intents`
#[derive(Debug, Clone, Serialize)]
pub struct NewPaymentIntent {
    pub amount: i64,
    pub currency: String,
    pub customer: String,
    #[serde(skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    pub automatic_payment_methods: AutomaticPaymentMethods,
}

impl NewPaymentIntent {
    pub fn new(amount: i64, currency: &str, customer: &str, metadata: Metadata) -> Self {
        Self {
            amount,
            currency: currency.to_string(),
            customer: customer.to_string(),
            metadata,
            automatic_payment_methods: AutomaticPaymentMethods { enabled: true },
        }
    }
}

#[async_trait]
pub trait StripeGateway: Send + Sync {
    /// Active prices of one type with their product expanded
    async fn list_prices(&self, kind: PriceType) -> BillingResult<Vec<Price>>;

    async fn retrieve_price(&self, id: &str) -> BillingResult<Price>;

    async fn retrieve_product(&self, id: &str) -> BillingResult<Product>;

    async fn retrieve_customer(&self, id: &str) -> BillingResult<Customer>;

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<Subscription>;

    async fn retrieve_payment_intent(&self, id: &str) -> BillingResult<PaymentIntent>;

    async fn retrieve_invoice(&self, id: &str) -> BillingResult<Invoice>;

    async fn retrieve_charge(&self, id: &str) -> BillingResult<Charge>;

    async fn create_customer(&self, params: &NewCustomer) -> BillingResult<Customer>;

    /// Pending invoice item, picked up by the customer's next invoice
    async fn create_invoice_item(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u32,
    ) -> BillingResult<()>;

    /// `default_incomplete` subscription with `latest_invoice.payment_intent` expanded
    async fn create_subscription(
        &self,
        customer_id: &str,
        price_ids: &[String],
    ) -> BillingResult<Subscription>;

    async fn create_payment_intent(&self, params: &NewPaymentIntent) -> BillingResult<PaymentIntent>;

    async fn update_payment_intent_metadata(
        &self,
        id: &str,
        metadata: &Metadata,
    ) -> BillingResult<PaymentIntent>;
}
