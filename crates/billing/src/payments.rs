//! Payment facts extracted from Stripe events
//!
//! Four event shapes carry money movements. Each is reduced to one
//! [`PaymentFacts`] value holding amounts in cents; dollars only appear
//! when a `Payments` row is rendered.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::json;

use greens_shared::timefmt::now_iso;
use greens_shared::Row;

use crate::error::BillingResult;
use crate::gateway::StripeGateway;
use crate::models::{ref_id, Charge, Invoice, Metadata, PaymentIntent, StripeEvent};

/// Event types that produce a payment row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEvent {
    IntentSucceeded,
    InvoicePaid,
    InvoiceFailed,
    ChargeRefunded,
}

impl PaymentEvent {
    pub fn from_type(event_type: &str) -> Option<Self> {
        match event_type.trim() {
            "payment_intent.succeeded" => Some(Self::IntentSucceeded),
            "invoice.payment_succeeded" => Some(Self::InvoicePaid),
            "invoice.payment_failed" => Some(Self::InvoiceFailed),
            "charge.refunded" => Some(Self::ChargeRefunded),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IntentSucceeded => "payment_intent.succeeded",
            Self::InvoicePaid => "invoice.payment_succeeded",
            Self::InvoiceFailed => "invoice.payment_failed",
            Self::ChargeRefunded => "charge.refunded",
        }
    }
}

impl fmt::Display for PaymentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Refunded => "Refunded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentKind {
    Charge,
    Refund,
}

impl PaymentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Charge => "Charge",
            Self::Refund => "Refund",
        }
    }
}

/// The Stripe object an event carried
#[derive(Debug, Clone)]
pub enum PaymentSource {
    PaymentIntent(PaymentIntent),
    Invoice(Invoice),
    Charge(Charge),
}

impl PaymentSource {
    pub fn id(&self) -> &str {
        match self {
            Self::PaymentIntent(pi) => &pi.id,
            Self::Invoice(invoice) => &invoice.id,
            Self::Charge(charge) => &charge.id,
        }
    }

    pub fn created(&self) -> i64 {
        match self {
            Self::PaymentIntent(pi) => pi.created,
            Self::Invoice(invoice) => invoice.created,
            Self::Charge(charge) => charge.created,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentFacts {
    pub event: PaymentEvent,
    pub source: PaymentSource,
    /// Signed cents; refunds are negative
    pub amount: i64,
    /// Refunded cents, zero unless refunded
    pub refund_amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub kind: PaymentKind,
    pub stripe_customer_id: Option<String>,
    pub charge_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub email: Option<String>,
    pub metadata: Metadata,
    pub card_brand: String,
    pub card_last4: String,
    pub failure_code: String,
    pub failure_message: String,
}

/// Charge behind an invoice. Newer API versions drop `invoice.charge`, so
/// fall back to the latest charge of the invoice's payment intent.
async fn invoice_charge(gateway: &dyn StripeGateway, invoice: &Invoice) -> Option<String> {
    if let Some(charge_id) = invoice.charge_id() {
        return Some(charge_id);
    }
    let pi = invoice.payment_intent()?;
    if let Some(expanded) = pi.as_object() {
        return ref_id(&expanded.latest_charge);
    }

    match gateway.retrieve_payment_intent(pi.id()).await {
        Ok(expanded) => ref_id(&expanded.latest_charge),
        Err(e) => {
            tracing::warn!(
                invoice_id = %invoice.id,
                payment_intent_id = %pi.id(),
                error = %e,
                "Could not fetch payment intent for invoice"
            );
            None
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Cents to dollars for sheet cells
pub fn dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

impl PaymentFacts {
    fn new(event: PaymentEvent, source: PaymentSource, status: PaymentStatus) -> Self {
        Self {
            event,
            source,
            amount: 0,
            refund_amount: 0,
            currency: "usd".to_string(),
            status,
            kind: PaymentKind::Charge,
            stripe_customer_id: None,
            charge_id: None,
            stripe_subscription_id: None,
            email: None,
            metadata: Metadata::new(),
            card_brand: String::new(),
            card_last4: String::new(),
            failure_code: String::new(),
            failure_message: String::new(),
        }
    }

    /// Facts for a payment event, `None` for any other event type
    pub async fn extract(
        gateway: &dyn StripeGateway,
        event: &StripeEvent,
    ) -> BillingResult<Option<Self>> {
        let Some(kind) = PaymentEvent::from_type(&event.type_) else {
            return Ok(None);
        };

        let facts = match kind {
            PaymentEvent::IntentSucceeded => {
                let pi: PaymentIntent = event.object()?;
                let mut subscription = non_blank(pi.metadata.get("subscription_id").cloned());

                if subscription.is_none() {
                    if let Some(invoice_id) = ref_id(&pi.invoice) {
                        match gateway.retrieve_invoice(&invoice_id).await {
                            Ok(invoice) => subscription = invoice.subscription_id(),
                            Err(e) => tracing::warn!(
                                invoice_id = %invoice_id,
                                error = %e,
                                "Could not fetch invoice for payment intent"
                            ),
                        }
                    }
                }

                let mut facts = Self::new(
                    kind,
                    PaymentSource::PaymentIntent(pi.clone()),
                    PaymentStatus::Succeeded,
                );
                facts.amount = pi.amount;
                facts.currency = pi.currency;
                facts.stripe_customer_id = ref_id(&pi.customer);
                facts.charge_id = ref_id(&pi.latest_charge);
                facts.stripe_subscription_id = subscription;
                facts.email = non_blank(pi.receipt_email);
                facts.metadata = pi.metadata;
                facts
            }
            PaymentEvent::InvoicePaid | PaymentEvent::InvoiceFailed => {
                let invoice: Invoice = event.object()?;
                let (status, amount) = if kind == PaymentEvent::InvoicePaid {
                    (PaymentStatus::Succeeded, invoice.amount_paid)
                } else {
                    (PaymentStatus::Failed, invoice.amount_due)
                };

                let mut facts =
                    Self::new(kind, PaymentSource::Invoice(invoice.clone()), status);
                facts.amount = amount;
                facts.currency = invoice.currency.clone();
                facts.stripe_customer_id = ref_id(&invoice.customer);
                facts.charge_id = invoice_charge(gateway, &invoice).await;
                facts.stripe_subscription_id = invoice.subscription_id();
                facts.email = non_blank(invoice.customer_email);
                facts.metadata = invoice.metadata;
                facts
            }
            PaymentEvent::ChargeRefunded => {
                let charge: Charge = event.object()?;

                let mut facts = Self::new(
                    kind,
                    PaymentSource::Charge(charge.clone()),
                    PaymentStatus::Refunded,
                );
                facts.amount = -charge.amount_refunded;
                facts.refund_amount = charge.amount_refunded;
                facts.currency = charge.currency;
                facts.kind = PaymentKind::Refund;
                facts.stripe_customer_id = ref_id(&charge.customer);
                facts.charge_id = Some(charge.id).filter(|id| !id.is_empty());
                facts.metadata = charge.metadata;
                facts
            }
        };

        Ok(Some(facts))
    }

    /// Fill in the email and card details from Stripe. Failures are logged.
    pub async fn enrich(&mut self, gateway: &dyn StripeGateway) {
        if self.email.is_none() {
            if let Some(customer_id) = &self.stripe_customer_id {
                match gateway.retrieve_customer(customer_id).await {
                    Ok(customer) => self.email = non_blank(customer.email),
                    Err(e) => tracing::warn!(
                        stripe_customer_id = %customer_id,
                        error = %e,
                        "Could not fetch customer email"
                    ),
                }
            }
        }

        let Some(charge_id) = &self.charge_id else {
            return;
        };
        match gateway.retrieve_charge(charge_id).await {
            Ok(charge) => self.apply_charge(&charge),
            Err(e) => tracing::warn!(charge_id = %charge_id, error = %e, "Could not fetch charge"),
        }
    }

    fn apply_charge(&mut self, charge: &Charge) {
        if let Some(card) = charge
            .payment_method_details
            .as_ref()
            .and_then(|d| d.card.as_ref())
        {
            self.card_brand = card.brand.clone();
            self.card_last4 = card.last4.clone();
        }

        if let Some(outcome) = &charge.outcome {
            if outcome.network_status.as_deref() != Some("approved_by_network") {
                self.failure_code = non_blank(charge.failure_code.clone())
                    .or_else(|| outcome.reason.clone())
                    .unwrap_or_default();
                self.failure_message = non_blank(charge.failure_message.clone())
                    .or_else(|| outcome.seller_message.clone())
                    .unwrap_or_default();
            }
        }
    }

    /// Charge ID, else the invoice's payment intent, else the carrying
    /// object's ID. Matches the key a `payment_intent.succeeded` event uses.
    pub fn external_id(&self) -> String {
        if let Some(charge_id) = &self.charge_id {
            return charge_id.clone();
        }
        if let PaymentSource::Invoice(invoice) = &self.source {
            if let Some(pi) = invoice.payment_intent() {
                return pi.id().to_string();
            }
        }
        self.source.id().to_string()
    }

    /// A `Payments` row (A..S)
    pub fn payment_row(&self, payment_id: &str, customer_id: &str, subscription_id: &str) -> Row {
        let now = now_iso();
        // Sorted keys keep the JSON stable across redeliveries
        let metadata: BTreeMap<&String, &String> = self.metadata.iter().collect();
        let metadata_json = serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());

        vec![
            json!(payment_id),
            json!(customer_id),
            json!(self.metadata.get("order_id").cloned().unwrap_or_default()),
            json!(subscription_id),
            json!(now),
            json!(dollars(self.amount)),
            json!(self.currency.to_uppercase()),
            json!(self.status.as_str()),
            json!(self.kind.as_str()),
            json!(self.stripe_customer_id.clone().unwrap_or_default()),
            json!(self.charge_id.clone().unwrap_or_default()),
            json!(self.card_brand),
            json!(self.card_last4),
            json!(dollars(self.refund_amount)),
            json!(self.failure_code),
            json!(self.failure_message),
            json!(metadata_json),
            json!(now),
            json!(now),
        ]
    }
}
