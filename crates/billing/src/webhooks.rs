//! Stripe webhook handling
//!
//! Verifies `Stripe-Signature` headers and reconciles events into the
//! workbook. Subscription lifecycle events go to [`SubscriptionSync`]; the
//! four payment events go through payment reconciliation:
//!
//! 1. payment facts (amounts, charge, card, subscription)
//! 2. internal customer, created from Stripe when missing
//! 3. internal subscription, force-created when missing and forced to
//!    `active` on successful payments
//! 4. the `Payments` row, reused when the same charge and status exist
//! 5. for successful payments, the order block
//!
//! An event ID is claimed before dispatch, so concurrent redeliveries wait and
//! then see it as processed. Steps 2-5 run under a lock on the payment's
//! external ID: a `payment_intent.succeeded` and an `invoice.payment_succeeded`
//! for the same charge never interleave their lookups and inserts.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;

use greens_shared::{KeyedLocks, Ledger, RowRef, Sheet};

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::gateway::StripeGateway;
use crate::models::StripeEvent;
use crate::orders::{OrderContext, OrderService};
use crate::payments::{PaymentFacts, PaymentKind, PaymentStatus};
use crate::subscriptions::SubscriptionSync;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;
const PROCESSED_EVENTS_CAPACITY: usize = 1024;

const SUBSCRIPTION_EVENT_PREFIX: &str = "customer.subscription.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Processed,
    /// Redelivery of an event that was already reconciled
    AlreadyProcessed,
}

/// Event IDs seen recently, oldest evicted first
#[derive(Default)]
struct ProcessedEvents {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl ProcessedEvents {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > PROCESSED_EVENTS_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Parsed `t=...,v1=...` header
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    fn parse(header: &str) -> Option<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                // Non-hex signatures can never match; drop them
                "v1" => signatures.extend(hex::decode(value).ok()),
                _ => {}
            }
        }

        Some(Self {
            timestamp: timestamp?,
            signatures,
        })
    }
}

/// Signature header for a payload, as Stripe would send it
#[cfg(any(test, feature = "test-util"))]
#[allow(clippy::unwrap_used)]
pub fn signature_header(secret: &str, payload: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    secret: String,
    gateway: Arc<dyn StripeGateway>,
    ledger: Ledger,
    customers: CustomerService,
    subscriptions: SubscriptionSync,
    orders: OrderService,
    processed: Arc<Mutex<ProcessedEvents>>,
    /// Event IDs and payment external IDs being reconciled
    locks: KeyedLocks,
}

impl WebhookHandler {
    pub fn new(
        secret: impl Into<String>,
        gateway: Arc<dyn StripeGateway>,
        ledger: Ledger,
        customers: CustomerService,
        subscriptions: SubscriptionSync,
        orders: OrderService,
    ) -> Self {
        Self {
            secret: secret.into(),
            gateway,
            ledger,
            customers,
            subscriptions,
            orders,
            processed: Arc::new(Mutex::new(ProcessedEvents::default())),
            locks: KeyedLocks::new(),
        }
    }

    /// Verify and parse a Stripe webhook event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<StripeEvent> {
        self.verify_event_at(payload, signature, chrono::Utc::now().timestamp())
    }

    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<StripeEvent> {
        let header = SignatureHeader::parse(signature).ok_or_else(|| {
            BillingError::WebhookSignatureInvalid(
                "Unable to extract timestamp and signatures from header".to_string(),
            )
        })?;

        if header.signatures.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid(
                "No signatures found with expected scheme".to_string(),
            ));
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
        mac.update(format!("{}.{}", header.timestamp, payload).as_bytes());

        let matched = header
            .signatures
            .iter()
            .any(|sig| mac.clone().verify_slice(sig).is_ok());
        if !matched {
            tracing::warn!(timestamp = header.timestamp, "Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid(
                "No signatures found matching the expected signature for payload".to_string(),
            ));
        }

        if (now - header.timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = header.timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid(
                "Timestamp outside the tolerance zone".to_string(),
            ));
        }

        serde_json::from_str(payload).map_err(|e| {
            BillingError::WebhookSignatureInvalid(format!("Invalid payload: {}", e))
        })
    }

    /// Handle a verified Stripe event
    pub async fn handle_event(&self, event: &StripeEvent) -> BillingResult<EventOutcome> {
        // Released on return, so a failed event can be redelivered
        let _claim = self.locks.lock(&format!("event:{}", event.id)).await;
        if self.processed.lock().await.contains(&event.id) {
            tracing::info!(event_id = %event.id, event_type = %event.type_, "Event already processed");
            return Ok(EventOutcome::AlreadyProcessed);
        }

        tracing::info!(event_id = %event.id, event_type = %event.type_, "Processing webhook event");

        if event.type_.starts_with(SUBSCRIPTION_EVENT_PREFIX) {
            self.subscriptions.handle_event(event).await?;
        } else {
            self.reconcile_payment(event).await?;
        }

        // Marked only after success
        self.processed.lock().await.insert(&event.id);
        Ok(EventOutcome::Processed)
    }

    async fn reconcile_payment(&self, event: &StripeEvent) -> BillingResult<()> {
        let Some(mut facts) = PaymentFacts::extract(self.gateway.as_ref(), event).await? else {
            tracing::debug!(event_type = %event.type_, "Unhandled event type");
            return Ok(());
        };
        facts.enrich(self.gateway.as_ref()).await;

        let _payment = self
            .locks
            .lock(&format!("payment:{}", facts.external_id()))
            .await;

        let customer = self.resolve_customer(&facts).await?;
        let subscription = self.resolve_subscription(&facts).await?;
        let customer_id = customer
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default();
        let subscription_id = subscription
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_default();

        let payment_id = self
            .record_payment(&facts, &customer_id, &subscription_id)
            .await?;

        if facts.status != PaymentStatus::Succeeded || facts.kind != PaymentKind::Charge {
            return Ok(());
        }

        let (shipping_address_id, billing_address_id) = match &customer {
            Some(found) => self.ledger.customer_address_ids(found.row).await?,
            None => (None, None),
        };
        let ctx = OrderContext {
            customer_id,
            shipping_address_id: shipping_address_id.unwrap_or_default(),
            billing_address_id: billing_address_id.unwrap_or_default(),
            subscription_id,
            stripe_subscription_id: subscription.and(facts.stripe_subscription_id.clone()),
            payment_id: Some(payment_id),
        };

        if let Err(e) = self.orders.record(&facts, &ctx).await {
            tracing::error!(
                event_id = %event.id,
                external_id = %facts.external_id(),
                error = %e,
                "Failed to record order"
            );
        }
        Ok(())
    }

    async fn resolve_customer(&self, facts: &PaymentFacts) -> BillingResult<Option<RowRef>> {
        if let Some(email) = &facts.email {
            if let Some(found) = self.ledger.find_customer_by_email(email).await? {
                return Ok(Some(found));
            }
        }

        let Some(stripe_customer_id) = &facts.stripe_customer_id else {
            tracing::warn!(event_type = %facts.event, "Payment has no customer");
            return Ok(None);
        };

        let mut customer = match self.gateway.retrieve_customer(stripe_customer_id).await {
            Ok(customer) => customer,
            Err(e) => {
                tracing::warn!(stripe_customer_id = %stripe_customer_id, error = %e, "Could not fetch Stripe customer");
                return Ok(None);
            }
        };
        if customer.email.as_deref().is_none_or(str::is_empty) {
            customer.email = facts.email.clone();
        }

        self.customers.ensure_from_stripe(&customer).await
    }

    async fn resolve_subscription(&self, facts: &PaymentFacts) -> BillingResult<Option<RowRef>> {
        let Some(stripe_subscription_id) = &facts.stripe_subscription_id else {
            return Ok(None);
        };

        let mut found = self
            .ledger
            .find_subscription_by_stripe_id(stripe_subscription_id)
            .await?;
        if found.is_none() {
            found = match self.subscriptions.force_sync(stripe_subscription_id).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::error!(
                        stripe_subscription_id = %stripe_subscription_id,
                        error = %e,
                        "Forced subscription sync failed"
                    );
                    None
                }
            };
        }

        if facts.status == PaymentStatus::Succeeded && found.is_some() {
            self.subscriptions
                .force_activate(stripe_subscription_id)
                .await;
        }

        Ok(found)
    }

    async fn record_payment(
        &self,
        facts: &PaymentFacts,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<String> {
        if let Some(charge_id) = &facts.charge_id {
            if let Some(existing) = self
                .ledger
                .find_payment_by_charge(charge_id, facts.status.as_str())
                .await?
            {
                tracing::info!(
                    payment_id = %existing.id,
                    charge_id = %charge_id,
                    status = facts.status.as_str(),
                    "Payment already recorded"
                );
                return Ok(existing.id);
            }
        }

        let payment_id = self
            .ledger
            .insert(Sheet::Payments, |id| {
                facts.payment_row(id, customer_id, subscription_id)
            })
            .await?;

        tracing::info!(
            payment_id = %payment_id,
            event_type = %facts.event,
            status = facts.status.as_str(),
            amount = facts.amount,
            "Recorded payment"
        );
        Ok(payment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeStripe;
    use crate::plans::PlanMatcher;
    use greens_shared::{InMemorySheets, KeyedLocks};

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"ping","created":1,"data":{"object":{}}}"#;
    const NOW: i64 = 1_700_000_000;

    fn handler() -> WebhookHandler {
        let stripe: Arc<dyn StripeGateway> = Arc::new(FakeStripe::new());
        let ledger = Ledger::new(Arc::new(InMemorySheets::new()));
        let plans = PlanMatcher::new(stripe.clone(), ledger.clone());
        let subscriptions = SubscriptionSync::new(stripe.clone(), ledger.clone(), plans.clone());
        let orders = OrderService::new(stripe.clone(), ledger.clone(), plans, subscriptions.clone());
        let customers = CustomerService::new(ledger.clone(), KeyedLocks::new());
        WebhookHandler::new(SECRET, stripe, ledger, customers, subscriptions, orders)
    }

    #[test]
    fn test_valid_signature() {
        let header = signature_header(SECRET, PAYLOAD, NOW);
        let event = handler().verify_event_at(PAYLOAD, &header, NOW + 10).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.type_, "ping");
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let good = signature_header(SECRET, PAYLOAD, NOW);
        let good_sig = good.split_once("v1=").unwrap().1;
        let header = format!("t={},v1={},v1={}", NOW, "ab".repeat(32), good_sig);
        assert!(handler().verify_event_at(PAYLOAD, &header, NOW).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = signature_header("whsec_other", PAYLOAD, NOW);
        let err = handler().verify_event_at(PAYLOAD, &header, NOW).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No signatures found matching the expected signature for payload"
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = signature_header(SECRET, PAYLOAD, NOW);
        let tampered = PAYLOAD.replace("evt_1", "evt_2");
        assert!(matches!(
            handler().verify_event_at(&tampered, &header, NOW),
            Err(BillingError::WebhookSignatureInvalid(_))
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let header = signature_header(SECRET, PAYLOAD, NOW);
        let err = handler()
            .verify_event_at(PAYLOAD, &header, NOW + SIGNATURE_TOLERANCE_SECS + 1)
            .unwrap_err();
        assert_eq!(err.to_string(), "Timestamp outside the tolerance zone");
    }

    #[test]
    fn test_malformed_header_rejected() {
        let err = handler().verify_event_at(PAYLOAD, "garbage", NOW).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to extract timestamp and signatures from header"
        );

        let err = handler()
            .verify_event_at(PAYLOAD, &format!("t={}", NOW), NOW)
            .unwrap_err();
        assert_eq!(err.to_string(), "No signatures found with expected scheme");
    }

    #[test]
    fn test_processed_events_are_bounded() {
        let mut seen = ProcessedEvents::default();
        for i in 0..PROCESSED_EVENTS_CAPACITY + 5 {
            seen.insert(&format!("evt_{}", i));
        }
        assert_eq!(seen.ids.len(), PROCESSED_EVENTS_CAPACITY);
        assert!(!seen.contains("evt_0"));
        assert!(seen.contains(&format!("evt_{}", PROCESSED_EVENTS_CAPACITY + 4)));
    }

    #[tokio::test]
    async fn test_event_claim_is_released_after_failure() {
        let handler = handler();
        let event: StripeEvent = serde_json::from_str(
            r#"{"id":"evt_bad","type":"payment_intent.succeeded","created":1,"data":{"object":"not an intent"}}"#,
        )
        .unwrap();

        assert!(handler.handle_event(&event).await.is_err());
        assert!(!handler.processed.lock().await.contains("evt_bad"));
        assert_eq!(handler.locks.active_keys(), 0);
        assert!(handler.handle_event(&event).await.is_err(), "retried, not acknowledged");
    }

    #[tokio::test]
    async fn test_redelivered_event_is_acknowledged() {
        let handler = handler();
        let event: StripeEvent = serde_json::from_str(PAYLOAD).unwrap();
        assert_eq!(handler.handle_event(&event).await.unwrap(), EventOutcome::Processed);
        assert_eq!(
            handler.handle_event(&event).await.unwrap(),
            EventOutcome::AlreadyProcessed
        );
    }
}
