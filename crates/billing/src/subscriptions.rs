//! Subscription rows
//!
//! Mirrors Stripe subscriptions into the `Subscriptions` sheet. Rows are
//! keyed by the Stripe subscription ID in column S; only subscriptions in a
//! billable state are written unless a successful payment forces the sync.
//! Writes for one Stripe subscription are serialized, so a webhook and a
//! forced sync never both append a row for it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

use greens_shared::timefmt::{add_interval, format_human_date, format_iso_date, now_iso};
use greens_shared::workbook::cols;
use greens_shared::{KeyedLocks, Ledger, Row, RowRef, Sheet};

use crate::error::{BillingError, BillingResult};
use crate::gateway::StripeGateway;
use crate::models::{ref_id, StripeEvent, Subscription};
use crate::plans::PlanMatcher;

/// Statuses worth a row without a forcing payment
const LOGGED_STATUSES: [&str; 5] = ["active", "trialing", "past_due", "canceled", "unpaid"];

/// Delay before the single retry of [`SubscriptionSync::force_activate`]
pub const ACTIVATION_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Created,
    Updated,
    Deleted,
}

impl SubscriptionEvent {
    pub fn from_type(event_type: &str) -> Option<Self> {
        match event_type {
            "customer.subscription.created" => Some(Self::Created),
            "customer.subscription.updated" => Some(Self::Updated),
            "customer.subscription.deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "customer.subscription.created",
            Self::Updated => "customer.subscription.updated",
            Self::Deleted => "customer.subscription.deleted",
        }
    }
}

/// Everything a `Subscriptions` row needs, resolved from Stripe and the sheet
#[derive(Debug, Clone, PartialEq)]
struct SubscriptionSnapshot {
    customer_id: String,
    plan_id: String,
    status: String,
    start_date: String,
    period_start: String,
    period_end: String,
    canceled_at: String,
    interval_unit: String,
    interval_count: u32,
    quantity: u32,
    amount: f64,
    currency: String,
    shipping_address_id: String,
    billing_address_id: String,
    stripe_customer_id: String,
    stripe_subscription_id: String,
}

impl SubscriptionSnapshot {
    /// `Subscriptions` row A..W
    fn row(&self, id: &str, notes: &str) -> Row {
        let now = now_iso();
        vec![
            json!(id),
            json!(self.customer_id),
            json!(self.plan_id),
            json!(self.status),
            json!(self.start_date),
            json!(self.period_start),
            json!(self.period_end),
            json!(self.canceled_at),
            json!(""),
            json!(self.interval_unit),
            json!(self.interval_count),
            json!(1),
            json!(self.quantity),
            json!(self.amount),
            json!(self.currency),
            json!(self.shipping_address_id),
            json!(self.billing_address_id),
            json!(self.stripe_customer_id),
            json!(self.stripe_subscription_id),
            json!(""),
            json!(notes),
            json!(now),
            json!(now),
        ]
    }
}

/// Billing dates for a subscription: (first billing, next billing)
fn billing_window(subscription: &Subscription, interval: Option<(&str, u32)>) -> (Option<i64>, Option<i64>) {
    let first = subscription.period_start().or(subscription.start_date);
    let next = subscription.period_end().or_else(|| {
        let (unit, count) = interval?;
        first.map(|ts| add_interval(ts, unit, count))
    });
    (first, next)
}

#[derive(Clone)]
pub struct SubscriptionSync {
    gateway: Arc<dyn StripeGateway>,
    ledger: Ledger,
    plans: PlanMatcher,
    retry_delay: Duration,
    locks: KeyedLocks,
}

impl SubscriptionSync {
    pub fn new(gateway: Arc<dyn StripeGateway>, ledger: Ledger, plans: PlanMatcher) -> Self {
        Self {
            gateway,
            ledger,
            plans,
            retry_delay: ACTIVATION_RETRY_DELAY,
            locks: KeyedLocks::new(),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// `customer.subscription.*` webhook events
    pub async fn handle_event(&self, event: &StripeEvent) -> BillingResult<()> {
        let Some(kind) = SubscriptionEvent::from_type(&event.type_) else {
            tracing::debug!(event_type = %event.type_, "Ignoring subscription event");
            return Ok(());
        };
        let subscription: Subscription = event.object()?;

        match kind {
            SubscriptionEvent::Deleted => self.mark_canceled(&subscription).await,
            _ => self.sync(&subscription, kind, false).await,
        }
    }

    /// Fetch a subscription from Stripe and write it as an update even if it is
    /// still `incomplete`. Returns the internal row when one exists afterwards.
    pub async fn force_sync(&self, stripe_subscription_id: &str) -> BillingResult<Option<RowRef>> {
        tracing::info!(
            stripe_subscription_id = %stripe_subscription_id,
            "Subscription missing from sheet, force-creating"
        );
        let subscription = self
            .gateway
            .retrieve_subscription(stripe_subscription_id)
            .await?;
        self.sync(&subscription, SubscriptionEvent::Updated, true)
            .await?;

        Ok(self
            .ledger
            .find_subscription_by_stripe_id(stripe_subscription_id)
            .await?)
    }

    /// Write `active` into the status column, retrying once when the row is
    /// not visible yet. Returns whether the status was written.
    pub async fn force_activate(&self, stripe_subscription_id: &str) -> bool {
        let strategy = FixedInterval::new(self.retry_delay).take(1);

        let result = Retry::spawn(strategy, || async {
            let found = self
                .ledger
                .find_subscription_by_stripe_id(stripe_subscription_id)
                .await?;
            let Some(found) = found else {
                tracing::debug!(
                    stripe_subscription_id = %stripe_subscription_id,
                    "Subscription row not found for activation"
                );
                return Err(BillingError::NotFound(format!(
                    "subscription {}",
                    stripe_subscription_id
                )));
            };

            self.ledger
                .update_cells(
                    Sheet::Subscriptions,
                    &cols::at(cols::subscriptions::STATUS, found.row),
                    vec![json!("active")],
                )
                .await?;
            Ok::<_, BillingError>(found.row)
        })
        .await;

        match result {
            Ok(row) => {
                tracing::info!(stripe_subscription_id = %stripe_subscription_id, row = row, "Forced subscription to active");
                true
            }
            Err(e) => {
                tracing::warn!(
                    stripe_subscription_id = %stripe_subscription_id,
                    error = %e,
                    "Could not force subscription to active"
                );
                false
            }
        }
    }

    /// Record the order that started a subscription (column T)
    pub async fn link_order(&self, stripe_subscription_id: &str, order_id: &str) -> BillingResult<bool> {
        let Some(found) = self
            .ledger
            .find_subscription_by_stripe_id(stripe_subscription_id)
            .await?
        else {
            tracing::warn!(
                stripe_subscription_id = %stripe_subscription_id,
                order_id = %order_id,
                "Subscription not found for order link"
            );
            return Ok(false);
        };

        self.ledger
            .update_cells(
                Sheet::Subscriptions,
                &cols::at(cols::subscriptions::CREATED_FROM_ORDER, found.row),
                vec![json!(order_id)],
            )
            .await?;
        tracing::info!(subscription_id = %found.id, order_id = %order_id, "Linked order to subscription");
        Ok(true)
    }

    async fn sync(
        &self,
        subscription: &Subscription,
        kind: SubscriptionEvent,
        force_log: bool,
    ) -> BillingResult<()> {
        let Some(snapshot) = self.snapshot(subscription, force_log).await? else {
            return Ok(());
        };

        let loggable = force_log || LOGGED_STATUSES.contains(&snapshot.status.as_str());
        if !loggable {
            tracing::info!(
                stripe_subscription_id = %subscription.id,
                status = %snapshot.status,
                "Skipping subscription until it becomes billable"
            );
            return Ok(());
        }

        let _guard = self.locks.lock(&subscription.id).await;
        let existing = self
            .ledger
            .find_subscription_by_stripe_id(&subscription.id)
            .await?;

        match (kind, existing) {
            (SubscriptionEvent::Created, Some(found)) => {
                tracing::info!(
                    subscription_id = %found.id,
                    stripe_subscription_id = %subscription.id,
                    "Subscription already recorded"
                );
            }
            (SubscriptionEvent::Updated, Some(found)) => {
                self.refresh(&found, &snapshot).await?;
            }
            (_, None) => {
                let notes = format!("Event: {}", kind.as_str());
                let id = self
                    .ledger
                    .insert(Sheet::Subscriptions, |id| snapshot.row(id, &notes))
                    .await?;
                tracing::info!(
                    subscription_id = %id,
                    stripe_subscription_id = %subscription.id,
                    status = %snapshot.status,
                    "Recorded subscription"
                );
            }
            (SubscriptionEvent::Deleted, Some(_)) => {}
        }
        Ok(())
    }

    /// `snapshot.status` is never `incomplete` here: unforced incomplete
    /// updates are skipped and forced ones are written as `active`
    async fn refresh(&self, found: &RowRef, snapshot: &SubscriptionSnapshot) -> BillingResult<()> {
        self.ledger
            .update_cells(
                Sheet::Subscriptions,
                &cols::at(cols::subscriptions::STATUS, found.row),
                vec![json!(snapshot.status)],
            )
            .await?;

        self.ledger
            .update_cells(
                Sheet::Subscriptions,
                &cols::at(cols::subscriptions::PERIODS, found.row),
                vec![json!(snapshot.period_start), json!(snapshot.period_end)],
            )
            .await?;
        self.ledger
            .update_cells(
                Sheet::Subscriptions,
                &cols::at(cols::subscriptions::UPDATED_AT, found.row),
                vec![json!(now_iso())],
            )
            .await?;

        tracing::info!(subscription_id = %found.id, status = %snapshot.status, "Updated subscription");
        Ok(())
    }

    async fn mark_canceled(&self, subscription: &Subscription) -> BillingResult<()> {
        let _guard = self.locks.lock(&subscription.id).await;
        let Some(found) = self
            .ledger
            .find_subscription_by_stripe_id(&subscription.id)
            .await?
        else {
            tracing::info!(
                stripe_subscription_id = %subscription.id,
                "Deleted subscription was never recorded"
            );
            return Ok(());
        };

        let ended = subscription.ended_at.or(subscription.canceled_at);
        self.ledger
            .update_cells(
                Sheet::Subscriptions,
                &cols::at(cols::subscriptions::STATUS, found.row),
                vec![json!("canceled")],
            )
            .await?;
        self.ledger
            .update_cells(
                Sheet::Subscriptions,
                &cols::at(cols::subscriptions::END_DATE, found.row),
                vec![json!(format_iso_date(ended))],
            )
            .await?;
        self.ledger
            .update_cells(
                Sheet::Subscriptions,
                &cols::at(cols::subscriptions::UPDATED_AT, found.row),
                vec![json!(now_iso())],
            )
            .await?;

        tracing::info!(subscription_id = %found.id, "Marked subscription canceled");
        Ok(())
    }

    async fn snapshot(
        &self,
        subscription: &Subscription,
        force_log: bool,
    ) -> BillingResult<Option<SubscriptionSnapshot>> {
        let Some(item) = subscription.first_item() else {
            tracing::warn!(stripe_subscription_id = %subscription.id, "Subscription has no items");
            return Ok(None);
        };
        let price = &item.price;
        let stripe_customer_id = ref_id(&subscription.customer).unwrap_or_default();

        let mut email = None;
        if !stripe_customer_id.is_empty() {
            match self.gateway.retrieve_customer(&stripe_customer_id).await {
                Ok(customer) => email = customer.email,
                Err(e) => tracing::warn!(
                    stripe_customer_id = %stripe_customer_id,
                    error = %e,
                    "Could not fetch customer for subscription"
                ),
            }
        }

        let mut customer_id = String::new();
        let mut shipping_address_id = String::new();
        let mut billing_address_id = String::new();
        if let Some(email) = email.as_deref().filter(|e| !e.is_empty()) {
            if let Some(found) = self.ledger.find_customer_by_email(email).await? {
                let (shipping, billing) = self.ledger.customer_address_ids(found.row).await?;
                customer_id = found.id;
                shipping_address_id = shipping.unwrap_or_default();
                billing_address_id = billing.unwrap_or_default();
            }
        }

        let plan_id = match self.plans.plan_for_price(price).await {
            Some(plan_id) => plan_id,
            None => price.id.clone(),
        };

        let mut status = subscription.status.clone();
        if force_log && status == "incomplete" {
            status = "active".to_string();
        }

        let (interval_unit, interval_count) = match &price.recurring {
            Some(r) => (r.interval.clone(), r.interval_count),
            None => ("one_time".to_string(), 1),
        };
        let interval = price
            .recurring
            .as_ref()
            .map(|r| (r.interval.as_str(), r.interval_count));
        let (first_billing, next_billing) = billing_window(subscription, interval);

        Ok(Some(SubscriptionSnapshot {
            customer_id,
            plan_id,
            status,
            start_date: format_iso_date(subscription.start_date),
            period_start: format_human_date(first_billing),
            period_end: format_human_date(next_billing),
            canceled_at: format_iso_date(subscription.canceled_at),
            interval_unit,
            interval_count,
            quantity: item.quantity.unwrap_or(1),
            amount: price.unit_amount.unwrap_or(0) as f64 / 100.0,
            currency: price.currency.to_uppercase(),
            shipping_address_id,
            billing_address_id,
            stripe_customer_id,
            stripe_subscription_id: subscription.id.clone(),
        }))
    }
}
