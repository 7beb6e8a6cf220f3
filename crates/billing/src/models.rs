//! Lean Stripe object models
//!
//! Only the fields the storefront reads. Every struct is `#[serde(default)]`
//! so objects rendered by newer API versions still deserialize; fields that
//! moved between versions are read from both places.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

pub type Metadata = HashMap<String, String>;

/// Objects that carry a Stripe ID
pub trait StripeObject {
    fn object_id(&self) -> &str;
}

/// A reference that is either a bare ID or the expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T: StripeObject> Expandable<T> {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(obj) => obj.object_id(),
        }
    }

    pub fn as_object(&self) -> Option<&T> {
        match self {
            Expandable::Id(_) => None,
            Expandable::Object(obj) => Some(obj),
        }
    }
}

/// ID of an optional reference, `None` when absent or blank
pub fn ref_id<T: StripeObject>(reference: &Option<Expandable<T>>) -> Option<String> {
    reference
        .as_ref()
        .map(|r| r.id().to_string())
        .filter(|id| !id.is_empty())
}

macro_rules! stripe_object {
    ($($ty:ty),*) => {
        $(impl StripeObject for $ty {
            fn object_id(&self) -> &str {
                &self.id
            }
        })*
    };
}

stripe_object!(Price, Product, Customer, PaymentIntent, Invoice, Charge, Subscription);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct List<T> {
    pub data: Vec<T>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    /// Deserialize `data.object` into a model
    pub fn object<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookEventNotSupported(format!(
                "{} payload could not be read: {}",
                self.type_, e
            ))
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Recurring {
    pub interval: String,
    pub interval_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Price {
    pub id: String,
    pub active: bool,
    pub currency: String,
    pub unit_amount: Option<i64>,
    pub product: Option<Expandable<Product>>,
    pub recurring: Option<Recurring>,
    #[serde(rename = "type")]
    pub type_: String,
}

impl Price {
    pub fn is_one_time(&self) -> bool {
        self.type_ == "one_time"
    }

    pub fn product_id(&self) -> Option<String> {
        ref_id(&self.product)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Address {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Customer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<Address>,
    pub metadata: Metadata,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub client_secret: Option<String>,
    pub customer: Option<Expandable<Customer>>,
    pub latest_charge: Option<Expandable<Charge>>,
    pub invoice: Option<Expandable<Invoice>>,
    pub receipt_email: Option<String>,
    pub metadata: Metadata,
    pub created: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscountAmount {
    pub amount: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShippingCost {
    pub amount_subtotal: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionDetails {
    pub subscription: Option<Expandable<Subscription>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InvoiceParent {
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InvoicePaymentDetails {
    pub payment_intent: Option<Expandable<PaymentIntent>>,
    pub charge: Option<Expandable<Charge>>,
}

/// Entry of `invoice.payments` on API versions that dropped `invoice.charge`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InvoicePayment {
    pub payment: InvoicePaymentDetails,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Invoice {
    pub id: String,
    pub customer: Option<Expandable<Customer>>,
    pub customer_email: Option<String>,
    pub subscription: Option<Expandable<Subscription>>,
    pub parent: Option<InvoiceParent>,
    pub charge: Option<Expandable<Charge>>,
    pub payment_intent: Option<Expandable<PaymentIntent>>,
    pub billing_reason: Option<String>,
    pub currency: String,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub subtotal: i64,
    pub tax: Option<i64>,
    pub total: i64,
    pub total_discount_amounts: Vec<DiscountAmount>,
    pub shipping_cost: Option<ShippingCost>,
    pub lines: List<InvoiceLine>,
    pub payments: List<InvoicePayment>,
    pub metadata: Metadata,
    pub created: i64,
}

impl Invoice {
    /// `charge`, or the first charge listed under `payments`
    pub fn charge_id(&self) -> Option<String> {
        ref_id(&self.charge).or_else(|| {
            self.payments
                .data
                .iter()
                .find_map(|p| ref_id(&p.payment.charge))
        })
    }

    /// `payment_intent`, or the first intent listed under `payments`
    pub fn payment_intent(&self) -> Option<&Expandable<PaymentIntent>> {
        self.payment_intent.as_ref().filter(|pi| !pi.id().is_empty()).or_else(|| {
            self.payments
                .data
                .iter()
                .find_map(|p| p.payment.payment_intent.as_ref())
                .filter(|pi| !pi.id().is_empty())
        })
    }

    /// `subscription`, or `parent.subscription_details.subscription` on newer API versions
    pub fn subscription_id(&self) -> Option<String> {
        ref_id(&self.subscription).or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| ref_id(&d.subscription))
        })
    }

    pub fn discount_total(&self) -> i64 {
        self.total_discount_amounts.iter().map(|d| d.amount).sum()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PriceDetails {
    pub price: String,
    pub product: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinePricing {
    pub price_details: Option<PriceDetails>,
    pub unit_amount_decimal: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InvoiceLine {
    pub id: String,
    pub description: Option<String>,
    pub amount: i64,
    pub quantity: Option<u32>,
    pub price: Option<Price>,
    pub pricing: Option<LinePricing>,
    pub discount_amounts: Vec<DiscountAmount>,
}

/// Price reference of an invoice line, whichever shape it came in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePrice {
    pub price_id: String,
    pub product_id: Option<String>,
    pub unit_amount: i64,
}

impl InvoiceLine {
    pub fn line_price(&self) -> Option<LinePrice> {
        if let Some(price) = &self.price {
            return Some(LinePrice {
                price_id: price.id.clone(),
                product_id: price.product_id(),
                unit_amount: price.unit_amount.unwrap_or(0),
            });
        }

        let pricing = self.pricing.as_ref()?;
        let details = pricing.price_details.as_ref()?;
        let unit_amount = pricing
            .unit_amount_decimal
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .map(|d| d.trunc() as i64)
            .unwrap_or(0);

        Some(LinePrice {
            price_id: details.price.clone(),
            product_id: Some(details.product.clone()).filter(|p| !p.is_empty()),
            unit_amount,
        })
    }

    pub fn discount_total(&self) -> i64 {
        self.discount_amounts.iter().map(|d| d.amount).sum()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CardDetails {
    pub brand: String,
    pub last4: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaymentMethodDetails {
    pub card: Option<CardDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChargeOutcome {
    pub network_status: Option<String>,
    pub reason: Option<String>,
    pub seller_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Charge {
    pub id: String,
    pub amount: i64,
    pub amount_refunded: i64,
    pub currency: String,
    pub customer: Option<Expandable<Customer>>,
    pub payment_method_details: Option<PaymentMethodDetails>,
    pub outcome: Option<ChargeOutcome>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub metadata: Metadata,
    pub created: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: Price,
    pub quantity: Option<u32>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Subscription {
    pub id: String,
    pub customer: Option<Expandable<Customer>>,
    pub status: String,
    pub start_date: Option<i64>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub canceled_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub items: List<SubscriptionItem>,
    pub latest_invoice: Option<Expandable<Invoice>>,
    pub metadata: Metadata,
    pub created: i64,
}

impl Subscription {
    pub fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.data.first()
    }

    /// Period dates moved onto subscription items in newer API versions
    pub fn period_start(&self) -> Option<i64> {
        self.current_period_start
            .or_else(|| self.first_item().and_then(|i| i.current_period_start))
    }

    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.first_item().and_then(|i| i.current_period_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expandable_accepts_id_or_object() {
        let pi: PaymentIntent = serde_json::from_value(json!({
            "id": "pi_1",
            "amount": 2500,
            "customer": "cus_1",
            "invoice": {"id": "in_1", "amount_due": 2500}
        }))
        .unwrap();

        assert_eq!(ref_id(&pi.customer).as_deref(), Some("cus_1"));
        let invoice = pi.invoice.as_ref().unwrap();
        assert_eq!(invoice.id(), "in_1");
        assert_eq!(invoice.as_object().unwrap().amount_due, 2500);
        assert!(pi.latest_charge.is_none());
    }

    #[test]
    fn test_invoice_subscription_from_parent() {
        let invoice: Invoice = serde_json::from_value(json!({
            "id": "in_1",
            "subscription": null,
            "parent": {"subscription_details": {"subscription": "sub_9"}}
        }))
        .unwrap();
        assert_eq!(invoice.subscription_id().as_deref(), Some("sub_9"));

        let legacy: Invoice =
            serde_json::from_value(json!({"id": "in_2", "subscription": "sub_1"})).unwrap();
        assert_eq!(legacy.subscription_id().as_deref(), Some("sub_1"));
    }

    #[test]
    fn test_line_price_shapes() {
        let legacy: InvoiceLine = serde_json::from_value(json!({
            "description": "Box",
            "amount": 3000,
            "price": {"id": "price_1", "product": "prod_1", "unit_amount": 1500}
        }))
        .unwrap();
        assert_eq!(
            legacy.line_price(),
            Some(LinePrice {
                price_id: "price_1".into(),
                product_id: Some("prod_1".into()),
                unit_amount: 1500
            })
        );

        let pricing: InvoiceLine = serde_json::from_value(json!({
            "amount": 3000,
            "pricing": {
                "price_details": {"price": "price_2", "product": "prod_2"},
                "unit_amount_decimal": "1500.75"
            }
        }))
        .unwrap();
        let lp = pricing.line_price().unwrap();
        assert_eq!(lp.price_id, "price_2");
        assert_eq!(lp.unit_amount, 1500);

        let neither: InvoiceLine = serde_json::from_value(json!({"amount": 10})).unwrap();
        assert!(neither.line_price().is_none());
    }

    #[test]
    fn test_subscription_period_fallback_to_item() {
        let sub: Subscription = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "active",
            "items": {"data": [{
                "price": {"id": "price_1", "unit_amount": 1000, "currency": "usd"},
                "current_period_start": 100,
                "current_period_end": 200
            }]}
        }))
        .unwrap();
        assert_eq!(sub.period_start(), Some(100));
        assert_eq!(sub.period_end(), Some(200));
    }

    #[test]
    fn test_event_object_decoding() {
        let event: StripeEvent = serde_json::from_value(json!({
            "id": "evt_1",
            "type": "charge.refunded",
            "created": 1,
            "data": {"object": {"id": "ch_1", "amount_refunded": 500}}
        }))
        .unwrap();
        let charge: Charge = event.object().unwrap();
        assert_eq!(charge.amount_refunded, 500);
    }
}
