//! In-memory [`StripeGateway`] for tests
//!
//! Objects are seeded from JSON fixtures shaped like Stripe API responses.
//! Writes are recorded so tests can assert on what would have been sent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use greens_shared::{InMemorySheets, Row, SheetsApi, SheetsResult};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{NewCustomer, NewPaymentIntent, PriceType, StripeGateway};
use crate::models::{
    Charge, Customer, Expandable, Invoice, List, Metadata, PaymentIntent, Price, Product,
    Subscription, SubscriptionItem,
};

/// Decode a JSON fixture, panicking with the serde error on a bad fixture
pub fn fixture<T: DeserializeOwned>(value: serde_json::Value) -> T {
    match serde_json::from_value(value) {
        Ok(v) => v,
        Err(e) => panic!("invalid Stripe fixture: {e}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedInvoiceItem {
    pub customer_id: String,
    pub price_id: String,
    pub quantity: u32,
}

#[derive(Default)]
struct FakeState {
    seq: u64,
    prices: HashMap<String, Price>,
    products: HashMap<String, Product>,
    customers: HashMap<String, Customer>,
    subscriptions: HashMap<String, Subscription>,
    payment_intents: HashMap<String, PaymentIntent>,
    invoices: HashMap<String, Invoice>,
    charges: HashMap<String, Charge>,
    failing: HashSet<&'static str>,
    invoice_without_intent: bool,
    created_customers: Vec<NewCustomer>,
    invoice_items: Vec<RecordedInvoiceItem>,
    created_subscriptions: Vec<(String, Vec<String>)>,
    created_payment_intents: Vec<NewPaymentIntent>,
    metadata_updates: Vec<(String, Metadata)>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{}_fake{}", prefix, self.seq)
    }

    fn check(&self, op: &'static str) -> BillingResult<()> {
        if self.failing.contains(op) {
            return Err(BillingError::StripeApi(format!("{} failed (injected)", op)));
        }
        Ok(())
    }
}

fn missing(kind: &str, id: &str) -> BillingError {
    BillingError::StripeApi(format!("No such {}: '{}'", kind, id))
}

#[derive(Default)]
pub struct FakeStripe {
    state: Mutex<FakeState>,
}

impl FakeStripe {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_price(&self, value: serde_json::Value) {
        let price: Price = fixture(value);
        self.state.lock().await.prices.insert(price.id.clone(), price);
    }

    pub async fn add_product(&self, value: serde_json::Value) {
        let product: Product = fixture(value);
        self.state
            .lock()
            .await
            .products
            .insert(product.id.clone(), product);
    }

    pub async fn add_customer(&self, value: serde_json::Value) {
        let customer: Customer = fixture(value);
        self.state
            .lock()
            .await
            .customers
            .insert(customer.id.clone(), customer);
    }

    pub async fn add_subscription(&self, value: serde_json::Value) {
        let sub: Subscription = fixture(value);
        self.state
            .lock()
            .await
            .subscriptions
            .insert(sub.id.clone(), sub);
    }

    pub async fn add_payment_intent(&self, value: serde_json::Value) {
        let pi: PaymentIntent = fixture(value);
        self.state
            .lock()
            .await
            .payment_intents
            .insert(pi.id.clone(), pi);
    }

    pub async fn add_invoice(&self, value: serde_json::Value) {
        let invoice: Invoice = fixture(value);
        self.state
            .lock()
            .await
            .invoices
            .insert(invoice.id.clone(), invoice);
    }

    pub async fn add_charge(&self, value: serde_json::Value) {
        let charge: Charge = fixture(value);
        self.state
            .lock()
            .await
            .charges
            .insert(charge.id.clone(), charge);
    }

    /// Make every call of one gateway method fail (`"retrieve_price"`, ...)
    pub async fn fail(&self, op: &'static str) {
        self.state.lock().await.failing.insert(op);
    }

    /// New subscriptions get an invoice without a payment intent
    pub async fn invoices_without_intent(&self) {
        self.state.lock().await.invoice_without_intent = true;
    }

    pub async fn created_customers(&self) -> Vec<NewCustomer> {
        self.state.lock().await.created_customers.clone()
    }

    pub async fn invoice_items(&self) -> Vec<RecordedInvoiceItem> {
        self.state.lock().await.invoice_items.clone()
    }

    pub async fn created_subscriptions(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().await.created_subscriptions.clone()
    }

    pub async fn created_payment_intents(&self) -> Vec<NewPaymentIntent> {
        self.state.lock().await.created_payment_intents.clone()
    }

    pub async fn metadata_updates(&self) -> Vec<(String, Metadata)> {
        self.state.lock().await.metadata_updates.clone()
    }
}

#[async_trait]
impl StripeGateway for FakeStripe {
    async fn list_prices(&self, kind: PriceType) -> BillingResult<Vec<Price>> {
        let state = self.state.lock().await;
        state.check("list_prices")?;

        let mut prices: Vec<Price> = state
            .prices
            .values()
            .filter(|p| p.active && p.type_ == kind.as_str())
            .cloned()
            .map(|mut price| {
                if let Some(Expandable::Id(product_id)) = &price.product {
                    if let Some(product) = state.products.get(product_id) {
                        price.product = Some(Expandable::Object(Box::new(product.clone())));
                    }
                }
                price
            })
            .collect();
        prices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(prices)
    }

    async fn retrieve_price(&self, id: &str) -> BillingResult<Price> {
        let state = self.state.lock().await;
        state.check("retrieve_price")?;
        state.prices.get(id).cloned().ok_or_else(|| missing("price", id))
    }

    async fn retrieve_product(&self, id: &str) -> BillingResult<Product> {
        let state = self.state.lock().await;
        state.check("retrieve_product")?;
        state.products.get(id).cloned().ok_or_else(|| missing("product", id))
    }

    async fn retrieve_customer(&self, id: &str) -> BillingResult<Customer> {
        let state = self.state.lock().await;
        state.check("retrieve_customer")?;
        state.customers.get(id).cloned().ok_or_else(|| missing("customer", id))
    }

    async fn retrieve_subscription(&self, id: &str) -> BillingResult<Subscription> {
        let state = self.state.lock().await;
        state.check("retrieve_subscription")?;
        state
            .subscriptions
            .get(id)
            .cloned()
            .ok_or_else(|| missing("subscription", id))
    }

    async fn retrieve_payment_intent(&self, id: &str) -> BillingResult<PaymentIntent> {
        let state = self.state.lock().await;
        state.check("retrieve_payment_intent")?;
        state
            .payment_intents
            .get(id)
            .cloned()
            .ok_or_else(|| missing("payment_intent", id))
    }

    async fn retrieve_invoice(&self, id: &str) -> BillingResult<Invoice> {
        let state = self.state.lock().await;
        state.check("retrieve_invoice")?;
        state.invoices.get(id).cloned().ok_or_else(|| missing("invoice", id))
    }

    async fn retrieve_charge(&self, id: &str) -> BillingResult<Charge> {
        let state = self.state.lock().await;
        state.check("retrieve_charge")?;
        state.charges.get(id).cloned().ok_or_else(|| missing("charge", id))
    }

    async fn create_customer(&self, params: &NewCustomer) -> BillingResult<Customer> {
        let mut state = self.state.lock().await;
        state.check("create_customer")?;

        let customer = Customer {
            id: state.next_id("cus"),
            email: Some(params.email.clone()),
            name: params.name.clone(),
            phone: params.phone.clone(),
            address: params.address.clone(),
            metadata: params.metadata.clone(),
            deleted: false,
        };
        state.created_customers.push(params.clone());
        state.customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn create_invoice_item(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u32,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.check("create_invoice_item")?;
        if !state.prices.contains_key(price_id) {
            return Err(missing("price", price_id));
        }

        state.invoice_items.push(RecordedInvoiceItem {
            customer_id: customer_id.to_string(),
            price_id: price_id.to_string(),
            quantity,
        });
        Ok(())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_ids: &[String],
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().await;
        state.check("create_subscription")?;

        let mut items = Vec::new();
        let mut amount_due = 0;
        let mut currency = "usd".to_string();
        for price_id in price_ids {
            let price = state
                .prices
                .get(price_id)
                .cloned()
                .ok_or_else(|| missing("price", price_id))?;
            amount_due += price.unit_amount.unwrap_or(0);
            currency = price.currency.clone();
            items.push(SubscriptionItem {
                id: format!("si_{}", price_id),
                price,
                quantity: Some(1),
                ..Default::default()
            });
        }

        // Pending invoice items land on the first invoice
        let pending: Vec<RecordedInvoiceItem> = state
            .invoice_items
            .iter()
            .filter(|i| i.customer_id == customer_id)
            .cloned()
            .collect();
        for item in pending {
            let unit = state
                .prices
                .get(&item.price_id)
                .and_then(|p| p.unit_amount)
                .unwrap_or(0);
            amount_due += unit * i64::from(item.quantity);
        }

        let sub_id = state.next_id("sub");
        let invoice_id = state.next_id("in");

        let intent = if state.invoice_without_intent {
            None
        } else {
            let pi_id = state.next_id("pi");
            let pi = PaymentIntent {
                client_secret: Some(format!("{}_secret", pi_id)),
                id: pi_id,
                amount: amount_due,
                currency: currency.clone(),
                status: "requires_payment_method".to_string(),
                customer: Some(Expandable::Id(customer_id.to_string())),
                invoice: Some(Expandable::Id(invoice_id.clone())),
                ..Default::default()
            };
            state.payment_intents.insert(pi.id.clone(), pi.clone());
            Some(pi)
        };

        let invoice = Invoice {
            id: invoice_id.clone(),
            customer: Some(Expandable::Id(customer_id.to_string())),
            subscription: Some(Expandable::Id(sub_id.clone())),
            payment_intent: intent.map(|pi| Expandable::Object(Box::new(pi))),
            billing_reason: Some("subscription_create".to_string()),
            currency: currency.clone(),
            amount_due,
            subtotal: amount_due,
            total: amount_due,
            ..Default::default()
        };

        let subscription = Subscription {
            id: sub_id.clone(),
            customer: Some(Expandable::Id(customer_id.to_string())),
            status: "incomplete".to_string(),
            items: List {
                data: items,
                has_more: false,
            },
            latest_invoice: Some(Expandable::Object(Box::new(invoice.clone()))),
            ..Default::default()
        };

        state.invoices.insert(invoice_id, invoice);
        state
            .subscriptions
            .insert(sub_id.clone(), subscription.clone());
        state
            .created_subscriptions
            .push((customer_id.to_string(), price_ids.to_vec()));

        Ok(subscription)
    }

    async fn create_payment_intent(&self, params: &NewPaymentIntent) -> BillingResult<PaymentIntent> {
        let mut state = self.state.lock().await;
        state.check("create_payment_intent")?;

        let id = state.next_id("pi");
        let pi = PaymentIntent {
            client_secret: Some(format!("{}_secret", id)),
            id,
            amount: params.amount,
            currency: params.currency.clone(),
            status: "requires_payment_method".to_string(),
            customer: Some(Expandable::Id(params.customer.clone())),
            metadata: params.metadata.clone(),
            ..Default::default()
        };
        state.created_payment_intents.push(params.clone());
        state.payment_intents.insert(pi.id.clone(), pi.clone());
        Ok(pi)
    }

    async fn update_payment_intent_metadata(
        &self,
        id: &str,
        metadata: &Metadata,
    ) -> BillingResult<PaymentIntent> {
        let mut state = self.state.lock().await;
        state.check("update_payment_intent_metadata")?;
        state
            .metadata_updates
            .push((id.to_string(), metadata.clone()));

        let pi = state
            .payment_intents
            .get_mut(id)
            .ok_or_else(|| missing("payment_intent", id))?;
        pi.metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(pi.clone())
    }
}

/// [`InMemorySheets`] that yields to the scheduler before every call, so
/// concurrent tasks interleave the way they would against a remote workbook
pub struct YieldingSheets {
    inner: Arc<InMemorySheets>,
}

impl YieldingSheets {
    pub fn new(inner: Arc<InMemorySheets>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SheetsApi for YieldingSheets {
    async fn get_values(&self, range: &str) -> SheetsResult<Vec<Vec<String>>> {
        tokio::task::yield_now().await;
        self.inner.get_values(range).await
    }

    async fn append_row(&self, sheet: &str, row: Row) -> SheetsResult<()> {
        tokio::task::yield_now().await;
        self.inner.append_row(sheet, row).await
    }

    async fn update_values(&self, range: &str, row: Row) -> SheetsResult<()> {
        tokio::task::yield_now().await;
        self.inner.update_values(range, row).await
    }
}
