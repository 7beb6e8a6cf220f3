//! Checkout orchestration
//!
//! One request creates a Stripe customer and then whichever payment object
//! fits the cart:
//!
//! | main price | add-ons | Stripe objects                                   | type            |
//! |------------|---------|--------------------------------------------------|-----------------|
//! | one-time   | yes     | invoice item (main) + subscription (add-ons)     | `mixed`         |
//! | one-time   | no      | payment intent for `unit_amount × quantity`      | `one_time`      |
//! | recurring  | yes     | invoice items (add-ons) + subscription (main)    | `mixed_reverse` |
//! | recurring  | no      | subscription (main)                              | `recurring`     |
//!
//! Subscription carts pay through the first invoice's payment intent, which
//! is tagged with the invoice and subscription IDs so the webhook can tie
//! the payment back to them.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{NewCustomer, NewPaymentIntent, StripeGateway};
use crate::models::{Address, Customer, Expandable, Invoice, Metadata, PaymentIntent, Subscription};

/// Shipping and contact details collected by the checkout form
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeliveryDetails {
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub apartment: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub company: Option<String>,
    pub sms_opt_in: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub price_id: Option<String>,
    pub email: Option<String>,
    pub delivery: Option<DeliveryDetails>,
    pub add_on_price_ids: Option<Vec<String>>,
    #[serde(deserialize_with = "quantity_field")]
    pub quantity: Option<i64>,
}

/// Quantities arrive as numbers or numeric strings
fn quantity_field<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Int(n)) => Some(n),
        Some(Raw::Float(f)) => Some(f.trunc() as i64),
        Some(Raw::Text(s)) => Some(s.trim().parse::<i64>().unwrap_or(0)),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutKind {
    Mixed,
    OneTime,
    MixedReverse,
    Recurring,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub customer_id: String,
    pub client_secret: Option<String>,
    #[serde(rename = "type")]
    pub kind: CheckoutKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
}

/// A validated checkout request
#[derive(Debug)]
struct Cart {
    price_id: String,
    email: String,
    add_ons: Vec<String>,
    quantity: u32,
}

fn required(value: Option<String>, message: &str) -> BillingResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::InvalidInput(message.to_string()))
}

fn check_price_id(id: &str) -> BillingResult<()> {
    stripe::PriceId::from_str(id)
        .map(|_| ())
        .map_err(|_| BillingError::InvalidInput(format!("Invalid price ID: {}", id)))
}

impl Cart {
    fn from_request(request: &CheckoutRequest) -> BillingResult<Self> {
        let price_id = required(request.price_id.clone(), "priceId is required")?;
        let email = required(request.email.clone(), "email is required")?;
        check_price_id(&price_id)?;

        let add_ons: Vec<String> = request
            .add_on_price_ids
            .iter()
            .flatten()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        for id in &add_ons {
            check_price_id(id)?;
        }

        let quantity = match request.quantity {
            None => 1,
            Some(q) if q >= 1 => u32::try_from(q)
                .map_err(|_| BillingError::InvalidInput("quantity is too large".to_string()))?,
            Some(_) => {
                return Err(BillingError::InvalidInput(
                    "quantity must be a positive integer".to_string(),
                ))
            }
        };

        Ok(Self {
            price_id,
            email,
            add_ons,
            quantity,
        })
    }
}

fn customer_params(email: &str, delivery: Option<&DeliveryDetails>) -> NewCustomer {
    let Some(d) = delivery else {
        return NewCustomer {
            email: email.to_string(),
            ..Default::default()
        };
    };

    let mut metadata = Metadata::new();
    metadata.insert("sms_opt_in".to_string(), d.sms_opt_in.to_string());
    metadata.insert("company".to_string(), d.company.clone().unwrap_or_default());

    let country = d
        .country
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| "US".to_string());

    NewCustomer {
        email: email.to_string(),
        name: Some(format!("{} {}", d.first_name, d.last_name).trim().to_string()),
        phone: d.phone.clone(),
        address: Some(Address {
            line1: d.address.clone(),
            line2: d.apartment.clone(),
            city: d.city.clone(),
            state: d.state.clone(),
            postal_code: d.zip.clone(),
            country: Some(country),
        }),
        metadata,
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    gateway: Arc<dyn StripeGateway>,
}

impl CheckoutService {
    pub fn new(gateway: Arc<dyn StripeGateway>) -> Self {
        Self { gateway }
    }

    pub async fn create(&self, request: CheckoutRequest) -> BillingResult<CheckoutResponse> {
        let cart = Cart::from_request(&request)?;

        let price = self.gateway.retrieve_price(&cart.price_id).await?;
        let customer = self
            .gateway
            .create_customer(&customer_params(&cart.email, request.delivery.as_ref()))
            .await?;

        let has_add_ons = !cart.add_ons.is_empty();
        let response = match (price.is_one_time(), has_add_ons) {
            (true, true) => {
                self.gateway
                    .create_invoice_item(&customer.id, &cart.price_id, cart.quantity)
                    .await?;
                self.subscribe(&customer, &cart.add_ons, CheckoutKind::Mixed)
                    .await?
            }
            (true, false) => {
                let mut metadata = Metadata::new();
                metadata.insert("price_id".to_string(), cart.price_id.clone());
                metadata.insert(
                    "product_id".to_string(),
                    price.product_id().unwrap_or_default(),
                );
                metadata.insert("quantity".to_string(), cart.quantity.to_string());

                let amount = price.unit_amount.unwrap_or(0) * i64::from(cart.quantity);
                let intent = self
                    .gateway
                    .create_payment_intent(&NewPaymentIntent::new(
                        amount,
                        &price.currency,
                        &customer.id,
                        metadata,
                    ))
                    .await?;

                CheckoutResponse {
                    customer_id: customer.id.clone(),
                    client_secret: intent.client_secret,
                    kind: CheckoutKind::OneTime,
                    subscription_id: None,
                    invoice_id: None,
                    payment_intent_id: Some(intent.id),
                }
            }
            (false, true) => {
                for add_on in &cart.add_ons {
                    self.gateway
                        .create_invoice_item(&customer.id, add_on, cart.quantity)
                        .await?;
                }
                self.subscribe(
                    &customer,
                    std::slice::from_ref(&cart.price_id),
                    CheckoutKind::MixedReverse,
                )
                .await?
            }
            (false, false) => {
                self.subscribe(
                    &customer,
                    std::slice::from_ref(&cart.price_id),
                    CheckoutKind::Recurring,
                )
                .await?
            }
        };

        tracing::info!(
            customer_id = %response.customer_id,
            price_id = %cart.price_id,
            kind = ?response.kind,
            add_ons = cart.add_ons.len(),
            quantity = cart.quantity,
            "Checkout created"
        );
        Ok(response)
    }

    async fn subscribe(
        &self,
        customer: &Customer,
        price_ids: &[String],
        kind: CheckoutKind,
    ) -> BillingResult<CheckoutResponse> {
        let subscription = self
            .gateway
            .create_subscription(&customer.id, price_ids)
            .await?;
        let invoice = self.latest_invoice(&subscription).await?;
        let intent = self
            .invoice_payment_intent(&customer.id, &subscription, &invoice)
            .await?;

        Ok(CheckoutResponse {
            customer_id: customer.id.clone(),
            client_secret: intent.client_secret,
            kind,
            subscription_id: Some(subscription.id),
            invoice_id: Some(invoice.id),
            payment_intent_id: None,
        })
    }

    async fn latest_invoice(&self, subscription: &Subscription) -> BillingResult<Invoice> {
        match &subscription.latest_invoice {
            Some(Expandable::Object(invoice)) => Ok((**invoice).clone()),
            Some(Expandable::Id(id)) => self.gateway.retrieve_invoice(id).await,
            None => Err(BillingError::StripeApi(format!(
                "Subscription {} has no invoice",
                subscription.id
            ))),
        }
    }

    /// Tag the invoice's payment intent, or create one for `amount_due`
    async fn invoice_payment_intent(
        &self,
        customer_id: &str,
        subscription: &Subscription,
        invoice: &Invoice,
    ) -> BillingResult<PaymentIntent> {
        let mut metadata = Metadata::new();
        metadata.insert("invoice_id".to_string(), invoice.id.clone());
        metadata.insert("subscription_id".to_string(), subscription.id.clone());

        match &invoice.payment_intent {
            Some(intent) => {
                self.gateway
                    .update_payment_intent_metadata(intent.id(), &metadata)
                    .await
            }
            None => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    amount_due = invoice.amount_due,
                    "Invoice has no payment intent, creating one"
                );
                self.gateway
                    .create_payment_intent(&NewPaymentIntent::new(
                        invoice.amount_due,
                        &invoice.currency,
                        customer_id,
                        metadata,
                    ))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeStripe;
    use serde_json::json;

    const ONCE: &str = "price_once";
    const WEEKLY: &str = "price_weekly";
    const ADDON: &str = "price_addon";

    async fn stripe() -> Arc<FakeStripe> {
        let stripe = Arc::new(FakeStripe::new());
        stripe
            .add_price(json!({
                "id": ONCE, "active": true, "type": "one_time", "currency": "usd",
                "unit_amount": 4000, "product": "prod_once"
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
                "id": ADDON, "active": true, "type": "one_time", "currency": "usd",
                "unit_amount": 500, "product": "prod_addon"
            }))
            .await;
        stripe
    }

    fn request(value: serde_json::Value) -> CheckoutRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_required_fields() {
        let service = CheckoutService::new(stripe().await);

        let err = service
            .create(request(json!({"email": "a@example.com"})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "priceId is required");

        let err = service
            .create(request(json!({"priceId": ONCE})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "email is required");
    }

    #[tokio::test]
    async fn test_malformed_ids_and_quantities_rejected() {
        let service = CheckoutService::new(stripe().await);

        let err = service
            .create(request(json!({"priceId": "prod_123", "email": "a@example.com"})))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let err = service
            .create(request(json!({"priceId": ONCE, "email": "a@example.com", "quantity": "zero"})))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_one_time_creates_payment_intent() {
        let stripe = stripe().await;
        let service = CheckoutService::new(stripe.clone());

        let response = service
            .create(request(json!({
                "priceId": ONCE,
                "email": "jane@example.com",
                "quantity": "3",
                "delivery": {
                    "firstName": "Jane", "lastName": "Doe", "phone": "555",
                    "address": "1 Main St", "city": "Las Vegas", "state": "NV",
                    "zip": "89101", "smsOptIn": true
                }
            })))
            .await
            .unwrap();

        assert_eq!(response.kind, CheckoutKind::OneTime);
        assert!(response.payment_intent_id.is_some());
        assert!(response.subscription_id.is_none());

        let intents = stripe.created_payment_intents().await;
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].amount, 12000);
        assert_eq!(intents[0].metadata["quantity"], "3");
        assert_eq!(intents[0].metadata["product_id"], "prod_once");

        let customers = stripe.created_customers().await;
        assert_eq!(customers[0].name.as_deref(), Some("Jane Doe"));
        assert_eq!(customers[0].metadata["sms_opt_in"], "true");
        assert_eq!(customers[0].metadata["company"], "");
        let address = customers[0].address.as_ref().unwrap();
        assert_eq!(address.country.as_deref(), Some("US"));
        assert_eq!(address.postal_code.as_deref(), Some("89101"));
    }

    #[tokio::test]
    async fn test_one_time_with_add_ons_is_mixed() {
        let stripe = stripe().await;
        let service = CheckoutService::new(stripe.clone());

        let response = service
            .create(request(json!({
                "priceId": ONCE,
                "email": "a@example.com",
                "quantity": 2,
                "addOnPriceIds": [WEEKLY]
            })))
            .await
            .unwrap();

        assert_eq!(response.kind, CheckoutKind::Mixed);
        let items = stripe.invoice_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].price_id, ONCE);
        assert_eq!(items[0].quantity, 2);

        let subs = stripe.created_subscriptions().await;
        assert_eq!(subs[0].1, vec![WEEKLY.to_string()]);

        let updates = stripe.metadata_updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0].1["subscription_id"],
            response.subscription_id.clone().unwrap()
        );
        assert_eq!(updates[0].1["invoice_id"], response.invoice_id.clone().unwrap());
    }

    #[tokio::test]
    async fn test_recurring_with_add_ons_is_mixed_reverse() {
        let stripe = stripe().await;
        let service = CheckoutService::new(stripe.clone());

        let response = service
            .create(request(json!({
                "priceId": WEEKLY,
                "email": "a@example.com",
                "addOnPriceIds": [ADDON, ONCE]
            })))
            .await
            .unwrap();

        assert_eq!(response.kind, CheckoutKind::MixedReverse);
        let items = stripe.invoice_items().await;
        assert_eq!(
            items.iter().map(|i| i.price_id.as_str()).collect::<Vec<_>>(),
            vec![ADDON, ONCE]
        );
        assert!(items.iter().all(|i| i.quantity == 1));
        assert_eq!(stripe.created_subscriptions().await[0].1, vec![WEEKLY.to_string()]);
    }

    #[tokio::test]
    async fn test_recurring_without_intent_creates_one_for_amount_due() {
        let stripe = stripe().await;
        stripe.invoices_without_intent().await;
        let service = CheckoutService::new(stripe.clone());

        let response = service
            .create(request(json!({"priceId": WEEKLY, "email": "a@example.com"})))
            .await
            .unwrap();

        assert_eq!(response.kind, CheckoutKind::Recurring);
        assert!(response.client_secret.is_some());
        let intents = stripe.created_payment_intents().await;
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].amount, 3499);
        assert_eq!(
            intents[0].metadata["subscription_id"],
            response.subscription_id.clone().unwrap()
        );
        assert!(stripe.metadata_updates().await.is_empty());
    }

    #[test]
    fn test_response_shape() {
        let response = CheckoutResponse {
            customer_id: "cus_1".into(),
            client_secret: Some("pi_1_secret".into()),
            kind: CheckoutKind::MixedReverse,
            subscription_id: None,
            invoice_id: None,
            payment_intent_id: Some("pi_1".into()),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "mixed_reverse");
        assert_eq!(value["customerId"], "cus_1");
        assert_eq!(value["paymentIntentId"], "pi_1");
        assert!(value.get("subscriptionId").is_none());
    }
}
