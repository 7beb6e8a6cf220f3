//! Storefront product catalog

use std::sync::Arc;

use serde::Serialize;

use crate::error::BillingResult;
use crate::gateway::{PriceType, StripeGateway};
use crate::models::Price;

/// Host whose images are served through `/product-image`
pub const STRIPE_FILES_HOST: &str = "files.stripe.com";

/// The storefront's price IDs
pub const DEFAULT_ALLOWED_PRICE_IDS: [&str; 4] = [
    "price_1SX1mBCFLmsUiqyIOdil0j6S",
    "price_1SX1jsCFLmsUiqyIiCnJ0aoS",
    "price_1SX1hOCFLmsUiqyIINhM5bQm",
    "price_1SX1evCFLmsUiqyIGK9H7eva",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProduct {
    pub id: String,
    pub product_id: String,
    pub name: String,
    pub description: String,
    /// Unit amount in dollars
    pub price: f64,
    pub currency: String,
    pub image: String,
    /// Recurring interval, or `one_time`
    pub interval: String,
    #[serde(rename = "type")]
    pub type_: String,
}

/// True for `https://files.stripe.com/...` style URLs
pub fn is_stripe_file_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(STRIPE_FILES_HOST)))
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct ProductCatalog {
    gateway: Arc<dyn StripeGateway>,
    allowed_price_ids: Vec<String>,
    public_base_url: String,
}

impl ProductCatalog {
    pub fn new(
        gateway: Arc<dyn StripeGateway>,
        allowed_price_ids: Vec<String>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            allowed_price_ids,
            public_base_url: public_base_url.into(),
        }
    }

    /// Allowed active prices, recurring first, as storefront products
    pub async fn list_products(&self) -> BillingResult<Vec<CatalogProduct>> {
        let mut prices = self.gateway.list_prices(PriceType::Recurring).await?;
        prices.extend(self.gateway.list_prices(PriceType::OneTime).await?);

        let products: Vec<CatalogProduct> = prices
            .iter()
            .filter(|p| self.allowed_price_ids.iter().any(|id| id == &p.id))
            .map(|p| self.to_product(p))
            .collect();

        tracing::debug!(
            listed = prices.len(),
            returned = products.len(),
            "Built product catalog"
        );
        Ok(products)
    }

    fn to_product(&self, price: &Price) -> CatalogProduct {
        let product = price.product.as_ref().and_then(|p| p.as_object());

        let image = product
            .and_then(|p| p.images.first())
            .map(|url| self.image_url(url))
            .unwrap_or_default();

        CatalogProduct {
            id: price.id.clone(),
            product_id: price.product_id().unwrap_or_default(),
            name: product.map(|p| p.name.clone()).unwrap_or_default(),
            description: product.and_then(|p| p.description.clone()).unwrap_or_default(),
            price: price.unit_amount.unwrap_or(0) as f64 / 100.0,
            currency: price.currency.clone(),
            image,
            interval: price
                .recurring
                .as_ref()
                .map(|r| r.interval.clone())
                .unwrap_or_else(|| "one_time".to_string()),
            type_: price.type_.clone(),
        }
    }

    /// Route Stripe-hosted images through our proxy to dodge CORS
    fn image_url(&self, url: &str) -> String {
        if !is_stripe_file_url(url) {
            return url.to_string();
        }

        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("url", url)
            .finish();
        format!(
            "{}/product-image?{}",
            self.public_base_url.trim_end_matches('/'),
            query
        )
    }
}
