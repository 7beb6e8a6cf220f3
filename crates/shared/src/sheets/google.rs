//! Google Sheets REST client (API v4)
//!
//! Authenticates with a service-account key (RS256 JWT assertion exchanged for
//! an OAuth access token) or a static bearer token. Transient failures are
//! retried with jittered exponential backoff.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use url::Url;

use super::{Row, SheetsApi};
use crate::error::{SheetsError, SheetsResult};

pub const DEFAULT_API_BASE_URL: &str = "https://sheets.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Tokens are refreshed this long before Google says they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const MAX_RETRIES: usize = 3;

/// The fields of a service-account JSON key file that matter here
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: impl AsRef<Path>) -> SheetsResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SheetsError::Credentials(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| SheetsError::Credentials(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone)]
pub enum SheetsAuth {
    ServiceAccount(ServiceAccountKey),
    /// Pre-issued OAuth token (local tooling, tests)
    BearerToken(String),
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct ValueBody<'a> {
    values: [&'a Row; 1],
}

#[derive(Clone)]
pub struct GoogleSheetsClient {
    http: reqwest::Client,
    spreadsheet_id: String,
    base_url: String,
    auth: SheetsAuth,
    token: Arc<RwLock<Option<CachedToken>>>,
}

impl GoogleSheetsClient {
    pub fn new(spreadsheet_id: impl Into<String>, auth: SheetsAuth) -> Self {
        Self {
            http: reqwest::Client::new(),
            spreadsheet_id: spreadsheet_id.into(),
            base_url: DEFAULT_API_BASE_URL.to_string(),
            auth,
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Point the client at another API host (emulators, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn spreadsheet_id(&self) -> &str {
        &self.spreadsheet_id
    }

    async fn access_token(&self) -> SheetsResult<String> {
        let key = match &self.auth {
            SheetsAuth::BearerToken(token) => return Ok(token.clone()),
            SheetsAuth::ServiceAccount(key) => key,
        };

        if let Some(cached) = self.token.read().await.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.token.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the write lock
        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.token.clone());
            }
        }

        let fresh = self.mint_token(key).await?;
        let token = fresh.token.clone();
        *slot = Some(fresh);
        Ok(token)
    }

    async fn mint_token(&self, key: &ServiceAccountKey) -> SheetsResult<CachedToken> {
        let iat = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: SHEETS_SCOPE,
            aud: &key.token_uri,
            iat,
            exp: iat + 3600,
        };

        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| SheetsError::Credentials(format!("invalid private key: {}", e)))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| SheetsError::Auth(format!("failed to sign assertion: {}", e)))?;

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", JWT_BEARER_GRANT)
            .append_pair("assertion", &assertion)
            .finish();

        let response = self
            .http
            .post(&key.token_uri)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            tracing::error!(status = status, "Google token exchange failed");
            return Err(SheetsError::Auth(format!("token endpoint returned {}: {}", status, text)));
        }

        let token: TokenResponse = response.json().await?;
        tracing::debug!(
            client_email = %key.client_email,
            expires_in = token.expires_in,
            "Minted Google Sheets access token"
        );

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        Ok(CachedToken {
            token: token.access_token,
            refresh_at: Instant::now() + lifetime,
        })
    }

    fn values_url(&self, range: &str, suffix: &str) -> SheetsResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SheetsError::InvalidRange(format!("bad base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| SheetsError::InvalidRange("base url cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values"])
            .push(&format!("{}{}", range, suffix));
        Ok(url)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        retry_if: fn(&SheetsError) -> bool,
        action: F,
    ) -> SheetsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SheetsResult<T>>,
    {
        let strategy = ExponentialBackoff::from_millis(10)
            .factor(20)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(MAX_RETRIES);

        RetryIf::spawn(strategy, action, |e: &SheetsError| {
            let retry = retry_if(e);
            if retry {
                tracing::warn!(op = op, error = %e, "Transient Sheets API failure, retrying");
            }
            retry
        })
        .await
    }

    async fn check(response: reqwest::Response) -> SheetsResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or(text);

        Err(SheetsError::Api { status, message })
    }

    async fn write(&self, method: reqwest::Method, url: Url, row: &Row) -> SheetsResult<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .json(&ValueBody { values: [row] })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Sheets returns formatted values as strings, but be lenient with numbers
fn cell_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SheetsApi for GoogleSheetsClient {
    async fn get_values(&self, range: &str) -> SheetsResult<Vec<Vec<String>>> {
        let url = self.values_url(range, "")?;

        let body: ValueRange = self
            .with_retry("get_values", SheetsError::is_transient, || {
                let url = url.clone();
                async move {
                    let token = self.access_token().await?;
                    let response = self.http.get(url).bearer_auth(token).send().await?;
                    let response = Self::check(response).await?;
                    Ok(response.json::<ValueRange>().await?)
                }
            })
            .await?;

        Ok(body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }

    async fn append_row(&self, sheet: &str, row: Row) -> SheetsResult<()> {
        let mut url = self.values_url(sheet, ":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED")
            .append_pair("insertDataOption", "INSERT_ROWS");

        // A 5xx or dropped response may still have appended the row
        self.with_retry("append_row", SheetsError::is_safe_to_resend, || {
            self.write(reqwest::Method::POST, url.clone(), &row)
        })
        .await
    }

    async fn update_values(&self, range: &str, row: Row) -> SheetsResult<()> {
        let mut url = self.values_url(range, "")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED");

        self.with_retry("update_values", SheetsError::is_transient, || {
            self.write(reqwest::Method::PUT, url.clone(), &row)
        })
        .await
    }
}
