//! Orders, order line items and deliveries
//!
//! A successful payment becomes one `Orders` row, one `Order Line Items`
//! row per purchased price, and a first cycle of `Deliveries` for every
//! line whose plan is in the plans table. Orders are keyed by the charge ID
//! (or the payment object's ID) in column T so redelivered events do not
//! create duplicates.

use std::fmt;
use std::sync::Arc;

use serde_json::json;

use greens_shared::timefmt::{format_iso_date, now_iso};
use greens_shared::workbook::cols;
use greens_shared::{Ledger, Plan, Sheet};

use crate::error::BillingResult;
use crate::gateway::StripeGateway;
use crate::models::{ref_id, Invoice, InvoiceLine, PaymentIntent};
use crate::payments::{dollars, PaymentFacts, PaymentSource};
use crate::plans::PlanMatcher;
use crate::subscriptions::SubscriptionSync;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
/// Days between the order and its first delivery
const FIRST_DELIVERY_LEAD_DAYS: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    InitialSubscription,
    SubscriptionRenewal,
    MixedOrOther,
    OneTime,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialSubscription => "Initial_Subscription",
            Self::SubscriptionRenewal => "Subscription_Renewal",
            Self::MixedOrOther => "Mixed_Or_Other",
            Self::OneTime => "One_Time",
        }
    }

    /// From an invoice's `billing_reason`, with the fallback for other reasons
    fn from_billing_reason(reason: Option<&str>, fallback: OrderType) -> Self {
        match reason {
            Some("subscription_create") => Self::InitialSubscription,
            Some("subscription_cycle") => Self::SubscriptionRenewal,
            _ => fallback,
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the order belongs to, resolved before the order block runs
#[derive(Debug, Clone, Default)]
pub struct OrderContext {
    pub customer_id: String,
    pub shipping_address_id: String,
    pub billing_address_id: String,
    /// Internal `SUB_` ID
    pub subscription_id: String,
    pub stripe_subscription_id: Option<String>,
    pub payment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineDraft {
    /// Internal plan ID, or the Stripe price ID when no plan matches
    pub plan_id: String,
    pub price_id: String,
    pub name: String,
    pub quantity: u32,
    /// Dollars
    pub unit_price: f64,
    /// Cents
    pub subtotal: i64,
    pub discount: i64,
    pub total: i64,
}

/// Order totals in cents plus lines, before anything is written
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub order_type: OrderType,
    pub subtotal: i64,
    pub discount: i64,
    pub shipping: i64,
    pub tax: i64,
    pub total: i64,
    pub lines: Vec<LineDraft>,
}

impl OrderDraft {
    fn from_amount(order_type: OrderType, amount: i64) -> Self {
        Self {
            order_type,
            subtotal: amount,
            discount: 0,
            shipping: 0,
            tax: 0,
            total: amount,
            lines: Vec::new(),
        }
    }

    fn apply_invoice_totals(&mut self, invoice: &Invoice) {
        self.subtotal = invoice.subtotal;
        self.tax = invoice.tax.unwrap_or(0);
        self.total = invoice.total;
        self.discount = invoice.discount_total();
        if let Some(shipping) = &invoice.shipping_cost {
            self.shipping = shipping.amount_subtotal;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOrder {
    pub order_id: String,
    pub order_type: OrderType,
    pub line_items: usize,
    pub deliveries: usize,
}

/// Scheduled delivery timestamps for one line item's first cycle
pub fn delivery_schedule(order_date: i64, plan: &Plan, order_type: OrderType) -> Vec<i64> {
    let one_time = order_type == OrderType::OneTime || plan.is_one_time();
    let count = if one_time {
        1
    } else {
        plan.deliveries_per_cycle.max(1)
    };
    let spacing_days = if one_time {
        0
    } else {
        i64::from(plan.cycle_days() / count)
    };

    let first = order_date + FIRST_DELIVERY_LEAD_DAYS * SECONDS_PER_DAY;
    (0..i64::from(count))
        .map(|i| first + i * spacing_days * SECONDS_PER_DAY)
        .collect()
}

#[derive(Clone)]
pub struct OrderService {
    gateway: Arc<dyn StripeGateway>,
    ledger: Ledger,
    plans: PlanMatcher,
    subscriptions: SubscriptionSync,
}

impl OrderService {
    pub fn new(
        gateway: Arc<dyn StripeGateway>,
        ledger: Ledger,
        plans: PlanMatcher,
        subscriptions: SubscriptionSync,
    ) -> Self {
        Self {
            gateway,
            ledger,
            plans,
            subscriptions,
        }
    }

    /// Write the order block for a successful payment. Returns `None` when an
    /// order for the same external ID already exists.
    pub async fn record(
        &self,
        facts: &PaymentFacts,
        ctx: &OrderContext,
    ) -> BillingResult<Option<RecordedOrder>> {
        let external_id = facts.external_id();
        if let Some(existing) = self.ledger.find_order_by_external_id(&external_id).await? {
            tracing::info!(
                order_id = %existing.id,
                external_id = %external_id,
                "Order already recorded for payment"
            );
            return Ok(None);
        }

        let mut draft = self.draft(facts).await;
        if draft.order_type == OrderType::OneTime && !ctx.subscription_id.is_empty() {
            draft.order_type = OrderType::InitialSubscription;
        }

        let order_date = facts.source.created();
        let order_id = self
            .append_order(facts, ctx, &draft, &external_id, order_date)
            .await?;

        for line in &draft.lines {
            self.append_line_item(&order_id, line).await?;
        }

        if draft.order_type == OrderType::InitialSubscription {
            if let Some(stripe_subscription_id) = &ctx.stripe_subscription_id {
                self.subscriptions
                    .link_order(stripe_subscription_id, &order_id)
                    .await?;
            }
        }

        if let Some(payment_id) = &ctx.payment_id {
            self.link_payment(payment_id, &order_id).await?;
        }

        let mut deliveries = 0;
        let plans = self.plans.plans().await;
        for line in draft.lines.iter().filter(|l| !l.plan_id.is_empty()) {
            let Some(plan) = plans.iter().find(|p| p.id == line.plan_id) else {
                tracing::debug!(plan_id = %line.plan_id, "No plan row, skipping deliveries");
                continue;
            };
            for (i, scheduled) in delivery_schedule(order_date, plan, draft.order_type)
                .into_iter()
                .enumerate()
            {
                self.append_delivery(&order_id, ctx, plan, i + 1, scheduled)
                    .await?;
                deliveries += 1;
            }
        }

        tracing::info!(
            order_id = %order_id,
            order_type = %draft.order_type,
            line_items = draft.lines.len(),
            deliveries = deliveries,
            "Recorded order"
        );

        Ok(Some(RecordedOrder {
            order_id,
            order_type: draft.order_type,
            line_items: draft.lines.len(),
            deliveries,
        }))
    }

    async fn draft(&self, facts: &PaymentFacts) -> OrderDraft {
        match &facts.source {
            PaymentSource::Invoice(invoice) => {
                let mut draft = OrderDraft::from_amount(
                    OrderType::from_billing_reason(
                        invoice.billing_reason.as_deref(),
                        OrderType::MixedOrOther,
                    ),
                    facts.amount,
                );
                draft.apply_invoice_totals(invoice);
                draft.lines = self.invoice_lines(invoice).await;
                draft
            }
            PaymentSource::PaymentIntent(event_pi) => {
                let pi = match self.gateway.retrieve_payment_intent(&event_pi.id).await {
                    Ok(pi) => pi,
                    Err(e) => {
                        tracing::warn!(payment_intent_id = %event_pi.id, error = %e, "Using event copy of payment intent");
                        event_pi.clone()
                    }
                };
                self.payment_intent_draft(facts, &pi).await
            }
            PaymentSource::Charge(_) => OrderDraft::from_amount(OrderType::OneTime, facts.amount),
        }
    }

    async fn payment_intent_draft(&self, facts: &PaymentFacts, pi: &PaymentIntent) -> OrderDraft {
        let mut draft = OrderDraft::from_amount(OrderType::OneTime, facts.amount);
        let metadata_subscription = pi
            .metadata
            .get("subscription_id")
            .is_some_and(|s| !s.is_empty());

        if pi.invoice.is_none() && !metadata_subscription {
            draft.lines.push(self.one_time_line(facts, pi).await);
            return draft;
        }

        let invoice_id = ref_id(&pi.invoice).or_else(|| pi.metadata.get("invoice_id").cloned());
        let Some(invoice_id) = invoice_id.filter(|id| !id.is_empty()) else {
            return draft;
        };

        match self.gateway.retrieve_invoice(&invoice_id).await {
            Ok(invoice) => {
                draft.order_type = OrderType::from_billing_reason(
                    invoice.billing_reason.as_deref(),
                    OrderType::InitialSubscription,
                );
                draft.apply_invoice_totals(&invoice);
                draft.lines = self.invoice_lines(&invoice).await;
            }
            Err(e) => {
                tracing::error!(invoice_id = %invoice_id, error = %e, "Could not fetch invoice for payment intent order");
            }
        }
        draft
    }

    async fn one_time_line(&self, facts: &PaymentFacts, pi: &PaymentIntent) -> LineDraft {
        let price_id = pi.metadata.get("price_id").cloned().unwrap_or_default();
        let product_id = pi
            .metadata
            .get("product_id")
            .cloned()
            .filter(|p| !p.is_empty());
        let quantity = pi
            .metadata
            .get("quantity")
            .and_then(|q| q.trim().parse::<u32>().ok())
            .filter(|q| *q > 0)
            .unwrap_or(1);

        let mut name = "One-Time Product".to_string();
        let mut plan_id = None;
        if let Some(product_id) = &product_id {
            match self.gateway.retrieve_product(product_id).await {
                Ok(product) => {
                    name = product.name;
                    plan_id = self.plans.plan_for_ids(&price_id, Some(product_id)).await;
                }
                Err(e) => {
                    tracing::warn!(product_id = %product_id, error = %e, "Could not fetch one-time product")
                }
            }
        }

        LineDraft {
            plan_id: plan_id.unwrap_or_else(|| price_id.clone()),
            price_id,
            name,
            quantity,
            unit_price: dollars(facts.amount) / f64::from(quantity),
            subtotal: facts.amount,
            discount: 0,
            total: facts.amount,
        }
    }

    async fn invoice_lines(&self, invoice: &Invoice) -> Vec<LineDraft> {
        let mut lines = Vec::new();
        for line in &invoice.lines.data {
            match self.invoice_line(line).await {
                Some(draft) => lines.push(draft),
                None => tracing::warn!(
                    invoice_id = %invoice.id,
                    line_id = %line.id,
                    "Invoice line has no price information, skipping"
                ),
            }
        }
        lines
    }

    async fn invoice_line(&self, line: &InvoiceLine) -> Option<LineDraft> {
        let line_price = line.line_price()?;

        let plan_id = match &line.price {
            Some(price) => self.plans.plan_for_price(price).await,
            None => {
                self.plans
                    .plan_for_ids(&line_price.price_id, line_price.product_id.as_deref())
                    .await
            }
        };

        Some(LineDraft {
            plan_id: plan_id.unwrap_or_else(|| line_price.price_id.clone()),
            price_id: line_price.price_id,
            name: line.description.clone().unwrap_or_default(),
            quantity: line.quantity.unwrap_or(1),
            unit_price: dollars(line_price.unit_amount),
            subtotal: line.amount,
            discount: line.discount_total(),
            total: line.amount,
        })
    }

    async fn append_order(
        &self,
        facts: &PaymentFacts,
        ctx: &OrderContext,
        draft: &OrderDraft,
        external_id: &str,
        order_date: i64,
    ) -> BillingResult<String> {
        let now = now_iso();
        let order_date = Some(format_iso_date(Some(order_date)))
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| now.clone());
        let currency = if facts.currency.is_empty() {
            "USD".to_string()
        } else {
            facts.currency.to_uppercase()
        };
        let notes = format!("Created from {}", facts.event);

        Ok(self
            .ledger
            .insert(Sheet::Orders, |id| {
                vec![
                    json!(id),
                    json!(ctx.customer_id),
                    json!(ctx.subscription_id),
                    json!(draft.order_type.as_str()),
                    json!(order_date),
                    json!("Paid"),
                    json!(currency),
                    json!(dollars(draft.subtotal)),
                    json!(dollars(draft.discount)),
                    json!(""),
                    json!(dollars(draft.shipping)),
                    json!(dollars(draft.tax)),
                    json!(dollars(draft.total)),
                    json!(ctx.shipping_address_id),
                    json!(ctx.billing_address_id),
                    json!("Standard"),
                    json!("Unfulfilled"),
                    json!(""),
                    json!("Stripe"),
                    json!(external_id),
                    json!(notes),
                    json!(now),
                    json!(now),
                ]
            })
            .await?)
    }

    async fn append_line_item(&self, order_id: &str, line: &LineDraft) -> BillingResult<String> {
        Ok(self
            .ledger
            .insert(Sheet::OrderLineItems, |id| {
                vec![
                    json!(id),
                    json!(order_id),
                    json!(line.plan_id),
                    json!(line.name),
                    json!(line.quantity),
                    json!(line.unit_price),
                    json!(dollars(line.subtotal)),
                    json!(dollars(line.discount)),
                    json!(dollars(line.total)),
                ]
            })
            .await?)
    }

    async fn link_payment(&self, payment_id: &str, order_id: &str) -> BillingResult<()> {
        let Some(row) = self.ledger.find_payment_row(payment_id).await? else {
            tracing::warn!(payment_id = %payment_id, "Payment not found for order link");
            return Ok(());
        };
        self.ledger
            .update_cells(
                Sheet::Payments,
                &cols::at(cols::payments::ORDER_ID, row),
                vec![json!(order_id)],
            )
            .await?;
        Ok(())
    }

    async fn append_delivery(
        &self,
        order_id: &str,
        ctx: &OrderContext,
        plan: &Plan,
        number_in_cycle: usize,
        scheduled: i64,
    ) -> BillingResult<String> {
        let now = now_iso();
        let date = format_iso_date(Some(scheduled));

        Ok(self
            .ledger
            .insert(Sheet::Deliveries, |id| {
                vec![
                    json!(id),
                    json!(ctx.customer_id),
                    json!(ctx.subscription_id),
                    json!(plan.id),
                    json!(1),
                    json!(number_in_cycle),
                    json!(date),
                    json!(date),
                    json!("Scheduled"),
                    json!(now),
                    json!(""),
                    json!(""),
                    json!(ctx.shipping_address_id),
                    json!(""),
                    json!(""),
                    json!(""),
                    json!(order_id),
                    json!(""),
                    json!(now),
                    json!(now),
                ]
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = SECONDS_PER_DAY;

    fn plan(unit: &str, count: u32, deliveries: u32) -> Plan {
        Plan {
            id: "PLAN_1".into(),
            name: "Box".into(),
            interval_unit: unit.into(),
            interval_count: count,
            deliveries_per_cycle: deliveries,
        }
    }

    #[test]
    fn test_weekly_single_delivery() {
        let dates = delivery_schedule(0, &plan("week", 1, 1), OrderType::InitialSubscription);
        assert_eq!(dates, vec![4 * DAY]);
    }

    #[test]
    fn test_monthly_plan_spreads_deliveries() {
        let dates = delivery_schedule(0, &plan("month", 1, 4), OrderType::InitialSubscription);
        // floor(30 / 4) = 7 days apart
        assert_eq!(dates, vec![4 * DAY, 11 * DAY, 18 * DAY, 25 * DAY]);
    }

    #[test]
    fn test_biweekly_two_per_cycle() {
        let dates = delivery_schedule(100, &plan("week", 2, 2), OrderType::SubscriptionRenewal);
        assert_eq!(dates, vec![100 + 4 * DAY, 100 + 11 * DAY]);
    }

    #[test]
    fn test_one_time_orders_get_one_delivery() {
        assert_eq!(
            delivery_schedule(0, &plan("month", 1, 4), OrderType::OneTime),
            vec![4 * DAY]
        );
        assert_eq!(
            delivery_schedule(0, &plan("none", 0, 3), OrderType::InitialSubscription),
            vec![4 * DAY]
        );
    }

    #[test]
    fn test_zero_deliveries_counts_as_one() {
        let dates = delivery_schedule(0, &plan("week", 1, 0), OrderType::InitialSubscription);
        assert_eq!(dates.len(), 1);
    }

    #[test]
    fn test_order_type_from_billing_reason() {
        assert_eq!(
            OrderType::from_billing_reason(Some("subscription_create"), OrderType::MixedOrOther),
            OrderType::InitialSubscription
        );
        assert_eq!(
            OrderType::from_billing_reason(Some("subscription_cycle"), OrderType::MixedOrOther),
            OrderType::SubscriptionRenewal
        );
        assert_eq!(
            OrderType::from_billing_reason(Some("manual"), OrderType::MixedOrOther),
            OrderType::MixedOrOther
        );
        assert_eq!(
            OrderType::from_billing_reason(None, OrderType::InitialSubscription),
            OrderType::InitialSubscription
        );
    }
}
