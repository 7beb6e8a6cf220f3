//! Customer and address rows
//!
//! Leads are captured before payment, so one checkout can hit this module
//! several times for the same email. Every write for an email runs under a
//! per-email lock to keep the find-then-append sequence from racing.

use serde::{Deserialize, Serialize};
use serde_json::json;

use greens_shared::hygiene::{format_name, format_text};
use greens_shared::timefmt::now_iso;
use greens_shared::workbook::cols;
use greens_shared::{AddressKind, KeyedLocks, Ledger, RowRef, Sheet};

use crate::error::{BillingError, BillingResult};
use crate::models::Customer;

const LEAD_SOURCE: &str = "Checkout Form";
const WEBHOOK_SOURCE: &str = "Stripe Webhook";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BillingAddressInput {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub apartment: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
}

/// `POST /capture-lead` body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeadRequest {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub apartment: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub company: Option<String>,
    pub billing_address: Option<BillingAddressInput>,
    pub same_as_shipping: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadCaptured {
    pub success: bool,
    pub customer_id: String,
    pub is_new: bool,
}

/// Address block of an email lookup; empty object when there is none
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LookupAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apartment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownCustomer {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub shipping_address_id: String,
    pub company: String,
    pub address: LookupAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailLookup {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<KnownCustomer>,
}

/// Address fields after hygiene
#[derive(Debug, Clone, Default, PartialEq)]
struct CleanAddress {
    first_name: String,
    last_name: String,
    company: String,
    phone: String,
    country: String,
    state: String,
    city: String,
    zip: String,
    line1: String,
    line2: String,
}

fn text(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

impl CleanAddress {
    fn new(
        first_name: &Option<String>,
        last_name: &Option<String>,
        company: &Option<String>,
        phone: &Option<String>,
        line1: &Option<String>,
        line2: &Option<String>,
        city: &Option<String>,
        state: &Option<String>,
        zip: &Option<String>,
        country: &Option<String>,
    ) -> Self {
        let country = text(country).trim().to_uppercase();
        Self {
            first_name: format_name(text(first_name)),
            last_name: format_name(text(last_name)),
            company: format_text(text(company)),
            phone: text(phone).trim().to_string(),
            country: if country.is_empty() { "US".to_string() } else { country },
            state: text(state).trim().to_uppercase(),
            city: format_text(text(city)),
            zip: text(zip).trim().to_string(),
            line1: format_text(text(line1)),
            line2: format_text(text(line2)),
        }
    }

    fn shipping(lead: &LeadRequest) -> Self {
        Self::new(
            &lead.first_name,
            &lead.last_name,
            &lead.company,
            &lead.phone,
            &lead.address,
            &lead.apartment,
            &lead.city,
            &lead.state,
            &lead.zip,
            &lead.country,
        )
    }

    fn billing(input: &BillingAddressInput) -> Self {
        Self::new(
            &input.first_name,
            &input.last_name,
            &input.company,
            &input.phone,
            &input.address,
            &input.apartment,
            &input.city,
            &input.state,
            &input.zip,
            &input.country,
        )
    }

    /// Columns D through M
    fn details(&self) -> Vec<serde_json::Value> {
        vec![
            json!(self.first_name),
            json!(self.last_name),
            json!(self.company),
            json!(self.phone),
            json!(self.country),
            json!(self.state),
            json!(self.city),
            json!(self.zip),
            json!(self.line1),
            json!(self.line2),
        ]
    }
}

/// First name and the remainder of a single display name
fn split_name(name: &str) -> (String, String) {
    let mut parts = name.split_whitespace();
    let first = parts.next().unwrap_or("").to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, rest)
}

#[derive(Clone)]
pub struct CustomerService {
    ledger: Ledger,
    locks: KeyedLocks,
}

impl CustomerService {
    pub fn new(ledger: Ledger, locks: KeyedLocks) -> Self {
        Self { ledger, locks }
    }

    /// Create or refresh the customer behind a checkout form, plus addresses
    pub async fn capture_lead(&self, lead: LeadRequest) -> BillingResult<LeadCaptured> {
        let email = lead
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| BillingError::InvalidInput("Email is required".to_string()))?
            .to_string();

        let _guard = self.locks.lock(&KeyedLocks::email_key(&email)).await;

        let first = format_name(text(&lead.first_name));
        let last = format_name(text(&lead.last_name));
        let full = format!("{} {}", first, last).trim().to_string();
        let phone = text(&lead.phone).trim().to_string();

        let (customer, is_new) = match self.ledger.find_customer_by_email(&email).await? {
            Some(existing) => {
                if !first.is_empty() || !last.is_empty() || !phone.is_empty() {
                    self.ledger
                        .update_cells(
                            Sheet::Customers,
                            &cols::at(cols::customers::CONTACT, existing.row),
                            vec![json!(phone), json!(first), json!(last), json!(full)],
                        )
                        .await?;
                }
                (existing, false)
            }
            None => {
                let now = now_iso();
                let id = self
                    .ledger
                    .insert(Sheet::Customers, |id| {
                        vec![
                            json!(id),
                            json!(now),
                            json!(email),
                            json!(phone),
                            json!(first),
                            json!(last),
                            json!(full),
                            json!("TRUE"),
                            json!("TRUE"),
                            json!(""),
                            json!(""),
                            json!(LEAD_SOURCE),
                            json!(now),
                            json!("Lead captured at checkout"),
                        ]
                    })
                    .await?;
                let created = self
                    .ledger
                    .find_customer_by_email(&email)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Internal(format!("Customer {} missing after append", id))
                    })?;
                tracing::info!(customer_id = %id, "Captured new lead");
                (created, true)
            }
        };

        let shipping_id = self
            .upsert_address(&customer, &CleanAddress::shipping(&lead), AddressKind::Shipping)
            .await?;

        if lead.same_as_shipping {
            if let Some(shipping_id) = &shipping_id {
                self.ledger
                    .update_cells(
                        Sheet::Customers,
                        &cols::at(cols::customers::BILLING_ADDRESS_ID, customer.row),
                        vec![json!(shipping_id)],
                    )
                    .await?;
            }
        } else if let Some(billing) = &lead.billing_address {
            self.upsert_address(&customer, &CleanAddress::billing(billing), AddressKind::Billing)
                .await?;
        }

        Ok(LeadCaptured {
            success: true,
            customer_id: customer.id,
            is_new,
        })
    }

    /// Update the customer's address of this kind, or append and link a new one
    async fn upsert_address(
        &self,
        customer: &RowRef,
        address: &CleanAddress,
        kind: AddressKind,
    ) -> BillingResult<Option<String>> {
        if address.line1.is_empty() {
            return Ok(None);
        }

        let now = now_iso();
        if let Some(existing) = self
            .ledger
            .find_address_by_customer_and_type(&customer.id, kind)
            .await?
        {
            self.ledger
                .update_cells(
                    Sheet::Addresses,
                    &cols::at(cols::addresses::DETAILS, existing.row),
                    address.details(),
                )
                .await?;
            self.ledger
                .update_cells(
                    Sheet::Addresses,
                    &cols::at(cols::addresses::UPDATED_AT, existing.row),
                    vec![json!(now)],
                )
                .await?;
            tracing::debug!(address_id = %existing.id, kind = %kind, "Updated address");
            return Ok(Some(existing.id));
        }

        let customer_id = customer.id.clone();
        let address_id = self
            .ledger
            .insert(Sheet::Addresses, |id| {
                let mut row = vec![json!(id), json!(customer_id), json!(kind.as_str())];
                row.extend(address.details());
                row.push(json!(now));
                row.push(json!(now));
                row
            })
            .await?;

        let link = match kind {
            AddressKind::Shipping => cols::customers::SHIPPING_ADDRESS_ID,
            AddressKind::Billing => cols::customers::BILLING_ADDRESS_ID,
        };
        self.ledger
            .update_cells(
                Sheet::Customers,
                &cols::at(link, customer.row),
                vec![json!(address_id)],
            )
            .await?;

        tracing::info!(address_id = %address_id, customer_id = %customer.id, kind = %kind, "Added address");
        Ok(Some(address_id))
    }

    /// `GET /check-email`
    pub async fn check_email(&self, email: Option<&str>) -> BillingResult<EmailLookup> {
        let email = email
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| BillingError::InvalidInput("Email is required".to_string()))?;

        let not_found = EmailLookup {
            exists: false,
            customer: None,
        };

        let Some(found) = self.ledger.find_customer_by_email(email).await? else {
            return Ok(not_found);
        };
        let Some(record) = self.ledger.customer_record(found.row).await? else {
            return Ok(not_found);
        };

        let mut address = LookupAddress::default();
        if !record.shipping_address_id.is_empty() {
            if let Some(found) = self
                .ledger
                .find_address_by_id(&record.shipping_address_id)
                .await?
            {
                address = LookupAddress {
                    address: Some(found.line1),
                    apartment: Some(found.line2),
                    city: Some(found.city),
                    state: Some(found.state),
                    zip: Some(found.zip),
                    country: Some(found.country),
                };
            }
        }

        Ok(EmailLookup {
            exists: true,
            customer: Some(KnownCustomer {
                first_name: record.first_name,
                last_name: record.last_name,
                email: record.email,
                phone: record.phone,
                shipping_address_id: record.shipping_address_id,
                company: String::new(),
                address,
            }),
        })
    }

    /// Internal customer for a Stripe customer, appending one when the
    /// email is not on the sheet yet. `None` when Stripe has no email.
    pub async fn ensure_from_stripe(&self, customer: &Customer) -> BillingResult<Option<RowRef>> {
        let Some(email) = customer
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
        else {
            return Ok(None);
        };

        let _guard = self.locks.lock(&KeyedLocks::email_key(email)).await;

        if let Some(found) = self.ledger.find_customer_by_email(email).await? {
            return Ok(Some(found));
        }

        let (first, last) = split_name(customer.name.as_deref().unwrap_or(""));
        let first = format_name(&first);
        let last = format_text(&last);
        let full = format!("{} {}", first, last).trim().to_string();
        let phone = customer.phone.clone().unwrap_or_default();
        let now = now_iso();
        let notes = format!("Created from Stripe customer {}", customer.id);

        let id = self
            .ledger
            .insert(Sheet::Customers, |id| {
                vec![
                    json!(id),
                    json!(now),
                    json!(email),
                    json!(phone),
                    json!(first),
                    json!(last),
                    json!(full),
                    json!("TRUE"),
                    json!("TRUE"),
                    json!(""),
                    json!(""),
                    json!(WEBHOOK_SOURCE),
                    json!(now),
                    json!(notes),
                ]
            })
            .await?;

        tracing::info!(customer_id = %id, stripe_customer_id = %customer.id, "Created customer from Stripe");
        Ok(self.ledger.find_customer_by_email(email).await?)
    }
}
