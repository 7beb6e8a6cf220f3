//! Matching Stripe prices to internal plan IDs
//!
//! A plan matches when its name equals the product name (trimmed,
//! case-insensitive) and its billing interval and count equal the price's.
//! One-time prices match plans with unit `none` and count `0`.

use std::sync::Arc;

use greens_shared::{Ledger, Plan};

use crate::gateway::StripeGateway;
use crate::models::{Expandable, Price, Product};

/// Internal plan ID for a product/price pair
pub fn find_internal_plan_id(plans: &[Plan], product: &Product, price: &Price) -> Option<String> {
    let name = product.name.trim().to_lowercase();
    let (interval, count) = match &price.recurring {
        Some(recurring) => (recurring.interval.to_lowercase(), recurring.interval_count),
        None => ("none".to_string(), 0),
    };

    let found = plans.iter().find(|plan| {
        !plan.name.is_empty()
            && plan.name.trim().to_lowercase() == name
            && plan.interval_unit == interval
            && plan.interval_count == count
    });

    match found {
        Some(plan) => {
            tracing::debug!(plan_id = %plan.id, product = %name, "Matched internal plan");
            Some(plan.id.clone())
        }
        None => {
            tracing::warn!(
                product = %name,
                interval = %interval,
                interval_count = count,
                "No internal plan matches Stripe price"
            );
            None
        }
    }
}

/// Resolves plan IDs, fetching whatever Stripe objects the caller lacks
#[derive(Clone)]
pub struct PlanMatcher {
    gateway: Arc<dyn StripeGateway>,
    ledger: Ledger,
}

impl PlanMatcher {
    pub fn new(gateway: Arc<dyn StripeGateway>, ledger: Ledger) -> Self {
        Self { gateway, ledger }
    }

    pub async fn plans(&self) -> Arc<Vec<Plan>> {
        self.ledger.plans().await
    }

    /// Plan for a full price object, fetching its product when not expanded
    pub async fn plan_for_price(&self, price: &Price) -> Option<String> {
        let product = match &price.product {
            Some(Expandable::Object(product)) => (**product).clone(),
            Some(Expandable::Id(id)) => match self.gateway.retrieve_product(id).await {
                Ok(product) => product,
                Err(e) => {
                    tracing::warn!(product_id = %id, error = %e, "Could not fetch product for plan lookup");
                    return None;
                }
            },
            None => return None,
        };

        let plans = self.plans().await;
        find_internal_plan_id(&plans, &product, price)
    }

    /// Plan for bare IDs: both the price and the product are fetched
    pub async fn plan_for_ids(&self, price_id: &str, product_id: Option<&str>) -> Option<String> {
        if price_id.is_empty() {
            return None;
        }

        let price = match self.gateway.retrieve_price(price_id).await {
            Ok(price) => price,
            Err(e) => {
                tracing::warn!(price_id = %price_id, error = %e, "Could not fetch price for plan lookup");
                return None;
            }
        };

        match product_id {
            Some(product_id) if price.product.is_none() => {
                let mut price = price;
                price.product = Some(Expandable::Id(product_id.to_string()));
                self.plan_for_price(&price).await
            }
            _ => self.plan_for_price(&price).await,
        }
    }
}
