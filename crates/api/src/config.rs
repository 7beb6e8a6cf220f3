//! Server configuration from environment variables

use std::time::Duration;

use anyhow::{bail, Context};

use greens_billing::DEFAULT_ALLOWED_PRICE_IDS;

pub const DEFAULT_PORT: u16 = 4242;
pub const DEFAULT_CLIENT_URL: &str = "http://localhost:5173";
pub const DEFAULT_CREDENTIALS_PATH: &str = "credentials.json";
pub const DEFAULT_REFERENCE_CACHE_TTL_SECS: u64 = 3600;

/// Where ledger rows are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetsBackend {
    Google,
    /// Process-local workbook, for local runs without a spreadsheet
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    /// Storefront origin allowed by CORS
    pub client_url: String,
    /// Base URL of this server, used for proxied product images
    pub public_base_url: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub allowed_price_ids: Vec<String>,
    pub sheets_backend: SheetsBackend,
    pub spreadsheet_id: String,
    pub google_credentials_path: String,
    /// Static OAuth token used instead of the service account
    pub sheets_access_token: Option<String>,
    pub sheets_api_base_url: Option<String>,
    pub reference_cache_ttl: Duration,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match var("PORT") {
            Some(p) => p.parse().with_context(|| format!("PORT is not a port: {}", p))?,
            None => DEFAULT_PORT,
        };

        let sheets_backend = match var("SHEETS_BACKEND").as_deref() {
            None | Some("google") => SheetsBackend::Google,
            Some("memory") => SheetsBackend::Memory,
            Some(other) => bail!("SHEETS_BACKEND must be 'google' or 'memory', got '{}'", other),
        };

        let Some(stripe_secret_key) = var("STRIPE_SECRET_KEY") else {
            bail!("STRIPE_SECRET_KEY not set");
        };

        let stripe_webhook_secret = var("STRIPE_WEBHOOK_SECRET").unwrap_or_else(|| {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhooks will be rejected");
            String::new()
        });

        let spreadsheet_id = var("SPREADSHEET_ID").unwrap_or_default();
        if sheets_backend == SheetsBackend::Google && spreadsheet_id.is_empty() {
            bail!("SPREADSHEET_ID not set");
        }

        let allowed_price_ids = match var("ALLOWED_PRICE_IDS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_ALLOWED_PRICE_IDS.iter().map(|id| id.to_string()).collect(),
        };

        let reference_cache_ttl = match var("REFERENCE_CACHE_TTL_SECS") {
            Some(secs) => secs
                .parse()
                .with_context(|| format!("REFERENCE_CACHE_TTL_SECS is not a number: {}", secs))?,
            None => DEFAULT_REFERENCE_CACHE_TTL_SECS,
        };

        Ok(Self {
            port,
            bind_address: var("BIND_ADDRESS").unwrap_or_else(|| format!("0.0.0.0:{}", port)),
            client_url: var("CLIENT_URL").unwrap_or_else(|| DEFAULT_CLIENT_URL.to_string()),
            public_base_url: var("PUBLIC_BASE_URL")
                .unwrap_or_else(|| format!("http://localhost:{}", port))
                .trim_end_matches('/')
                .to_string(),
            stripe_secret_key,
            stripe_webhook_secret,
            allowed_price_ids,
            sheets_backend,
            spreadsheet_id,
            google_credentials_path: var("GOOGLE_APPLICATION_CREDENTIALS")
                .unwrap_or_else(|| DEFAULT_CREDENTIALS_PATH.to_string()),
            sheets_access_token: var("GOOGLE_SHEETS_ACCESS_TOKEN"),
            sheets_api_base_url: var("SHEETS_API_BASE_URL"),
            reference_cache_ttl: Duration::from_secs(reference_cache_ttl),
        })
    }
}
