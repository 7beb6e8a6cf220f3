//! Stripe API client
//!
//! Requests go through `stripe::Client`'s generic form/query helpers and are
//! decoded into the lean models in [`crate::models`], which keeps us working
//! when Stripe adds or moves fields.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BillingResult;
use crate::gateway::{NewCustomer, NewPaymentIntent, PriceType, StripeGateway};
use crate::models::{
    Charge, Customer, Invoice, List, Metadata, PaymentIntent, Price, Product, Subscription,
};

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
        }
    }
}

/// Stripe client wrapper
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key),
        }
    }
}

const PRICE_PAGE_SIZE: u32 = 100;

#[derive(Serialize)]
struct ListPrices<'a> {
    active: bool,
    #[serde(rename = "type")]
    type_: &'a str,
    limit: u32,
    expand: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    starting_after: Option<&'a str>,
}

#[derive(Serialize)]
struct NewInvoiceItem<'a> {
    customer: &'a str,
    price: &'a str,
    quantity: u32,
}

#[derive(Serialize)]
struct SubscriptionItemParams<'a> {
    price: &'a str,
}

#[derive(Serialize)]
struct PaymentSettings {
    save_default_payment_method: &'static str,
}

#[derive(Serialize)]
struct NewSubscription<'a> {
    customer: &'a str,
    items: Vec<SubscriptionItemParams<'a>>,
    payment_behavior: &'static str,
    payment_settings: PaymentSettings,
    expand: &'a [&'a str],
}

#[derive(Serialize)]
struct MetadataUpdate<'a> {
    metadata: &'a Metadata,
}

#[async_trait]
impl StripeGateway for StripeClient {
    async fn list_prices(&self, kind: PriceType) -> BillingResult<Vec<Price>> {
        let mut prices = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = ListPrices {
                active: true,
                type_: kind.as_str(),
                limit: PRICE_PAGE_SIZE,
                expand: &["data.product"],
                starting_after: cursor.as_deref(),
            };
            let page: List<Price> = self.inner.get_query("/prices", &params).await?;

            cursor = page.data.last().map(|p| p.id.clone());
            let more = page.has_more && cursor.is_some();
            prices.extend(page.data);
            if !more {
                break;
            }
        }

        tracing::debug!(kind = kind.as_str(), count = prices.len(), "Listed Stripe prices");
        Ok(prices)
    }

    async fn retrieve_price(&self, id: &str) -> BillingResult<Price> {
        Ok(self.inner.get(&format!("/prices/{}", id)).await?)
    }

    async fn retrieve_product(&self, id: &str) -> BillingResult<Product> {
        Ok(self.inner.get(&format!("/products/{}", id)).await?)
    }

    async fn retrieve_customer(&self, id: &str) -> BillingResult<Customer> {
        Ok(self.inner.get(&format!("/customers/{}", id)).await?)
    }

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<Subscription> {
        Ok(self.inner.get(&format!("/subscriptions/{}", id)).await?)
    }

    async fn retrieve_payment_intent(&self, id: &str) -> BillingResult<PaymentIntent> {
        Ok(self.inner.get(&format!("/payment_intents/{}", id)).await?)
    }

    async fn retrieve_invoice(&self, id: &str) -> BillingResult<Invoice> {
        Ok(self.inner.get(&format!("/invoices/{}", id)).await?)
    }

    async fn retrieve_charge(&self, id: &str) -> BillingResult<Charge> {
        Ok(self.inner.get(&format!("/charges/{}", id)).await?)
    }

    async fn create_customer(&self, params: &NewCustomer) -> BillingResult<Customer> {
        let customer: Customer = self.inner.post_form("/customers", params).await?;
        tracing::info!(customer_id = %customer.id, "Created Stripe customer");
        Ok(customer)
    }

    async fn create_invoice_item(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u32,
    ) -> BillingResult<()> {
        let params = NewInvoiceItem {
            customer: customer_id,
            price: price_id,
            quantity,
        };
        let _: serde_json::Value = self.inner.post_form("/invoiceitems", &params).await?;

        tracing::info!(
            customer_id = %customer_id,
            price_id = %price_id,
            quantity = quantity,
            "Created pending invoice item"
        );
        Ok(())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_ids: &[String],
    ) -> BillingResult<Subscription> {
        let params = NewSubscription {
            customer: customer_id,
            items: price_ids
                .iter()
                .map(|price| SubscriptionItemParams {
                    price: price.as_str(),
                })
                .collect(),
            payment_behavior: "default_incomplete",
            payment_settings: PaymentSettings {
                save_default_payment_method: "on_subscription",
            },
            expand: &["latest_invoice.payment_intent"],
        };

        let subscription: Subscription = self.inner.post_form("/subscriptions", &params).await?;
        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Created Stripe subscription"
        );
        Ok(subscription)
    }

    async fn create_payment_intent(&self, params: &NewPaymentIntent) -> BillingResult<PaymentIntent> {
        let intent: PaymentIntent = self.inner.post_form("/payment_intents", params).await?;
        tracing::info!(
            payment_intent_id = %intent.id,
            amount = intent.amount,
            "Created payment intent"
        );
        Ok(intent)
    }

    async fn update_payment_intent_metadata(
        &self,
        id: &str,
        metadata: &Metadata,
    ) -> BillingResult<PaymentIntent> {
        Ok(self
            .inner
            .post_form(&format!("/payment_intents/{}", id), MetadataUpdate { metadata })
            .await?)
    }
}
