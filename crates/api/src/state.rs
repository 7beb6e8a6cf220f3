//! Application state

use std::sync::Arc;

use reqwest::Client;

use greens_billing::{BillingService, BillingSettings, StripeClient, StripeConfig, StripeGateway};
use greens_shared::sheets::ServiceAccountKey;
use greens_shared::{GoogleSheetsClient, InMemorySheets, Ledger, SheetsApi, SheetsAuth};

use crate::config::{Config, SheetsBackend};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    /// Client for the product image proxy
    pub http_client: Client,
}

impl AppState {
    pub fn new(billing: BillingService) -> Self {
        Self {
            billing: Arc::new(billing),
            http_client: Client::new(),
        }
    }

    /// Wire Stripe and the configured sheets backend
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let sheets: Arc<dyn SheetsApi> = match config.sheets_backend {
            SheetsBackend::Memory => {
                tracing::warn!("Using in-memory sheets, rows are lost on restart");
                Arc::new(InMemorySheets::new())
            }
            SheetsBackend::Google => {
                let auth = match &config.sheets_access_token {
                    Some(token) => SheetsAuth::BearerToken(token.clone()),
                    None => SheetsAuth::ServiceAccount(ServiceAccountKey::from_file(
                        &config.google_credentials_path,
                    )?),
                };
                let mut client = GoogleSheetsClient::new(&config.spreadsheet_id, auth);
                if let Some(base_url) = &config.sheets_api_base_url {
                    client = client.with_base_url(base_url);
                }
                tracing::info!(spreadsheet_id = %config.spreadsheet_id, "Google Sheets ledger configured");
                Arc::new(client)
            }
        };
        let ledger = Ledger::new(sheets).with_reference_ttl(config.reference_cache_ttl);

        let stripe_config = StripeConfig::new(config.stripe_secret_key.clone());
        let stripe: Arc<dyn StripeGateway> = Arc::new(StripeClient::new(stripe_config));

        let billing = BillingService::new(
            stripe,
            ledger,
            BillingSettings {
                webhook_secret: config.stripe_webhook_secret.clone(),
                allowed_price_ids: config.allowed_price_ids.clone(),
                public_base_url: config.public_base_url.clone(),
            },
        );

        Ok(Self::new(billing))
    }
}
