//! Row-level operations over the workbook
//!
//! The workbook has no indexes, so every lookup is a linear scan of one
//! column followed by a targeted read of the matching row. Row numbers are
//! 1-based sheet rows, ready to be used in A1 ranges.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::discounts::DiscountCode;
use crate::error::{SheetsError, SheetsResult};
use crate::locks::KeyedLocks;
use crate::plans::Plan;
use crate::sheets::{Row, SheetsApi};
use crate::workbook::{cols, AddressKind, Sheet};

pub const DEFAULT_REFERENCE_TTL: Duration = Duration::from_secs(60 * 60);

/// A located row: its ID (column A) and 1-based sheet row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRef {
    pub id: String,
    pub row: usize,
}

/// `Customers!A:K` of one row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerRecord {
    pub id: String,
    pub created_at: String,
    pub email: String,
    pub phone: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub email_opt_in: String,
    pub sms_opt_in: String,
    pub shipping_address_id: String,
    pub billing_address_id: String,
}

/// Postal fields of an `Addresses` row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRecord {
    pub country: String,
    pub state: String,
    pub city: String,
    pub zip: String,
    pub line1: String,
    pub line2: String,
}

struct Cached<T> {
    loaded_at: Instant,
    items: Arc<Vec<T>>,
}

type CacheSlot<T> = Arc<RwLock<Option<Cached<T>>>>;

#[derive(Clone)]
pub struct Ledger {
    sheets: Arc<dyn SheetsApi>,
    sheet_locks: KeyedLocks,
    reference_ttl: Duration,
    plans: CacheSlot<Plan>,
    discount_codes: CacheSlot<DiscountCode>,
}

fn cell(row: &[String], idx: usize) -> String {
    row.get(idx).cloned().unwrap_or_default()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Highest `PREFIX_nnnnn` suffix in a column A read, plus one
fn next_id_from(prefix: &str, ids: &[Vec<String>]) -> String {
    let marker = format!("{}_", prefix);
    let next = ids
        .iter()
        .skip(1)
        .filter_map(|row| row.first())
        .filter_map(|id| id.trim().strip_prefix(&marker)?.parse::<u64>().ok())
        .max()
        .map(|n| n + 1)
        .unwrap_or(1);

    format!("{}_{:05}", prefix, next)
}

impl Ledger {
    pub fn new(sheets: Arc<dyn SheetsApi>) -> Self {
        Self {
            sheets,
            sheet_locks: KeyedLocks::new(),
            reference_ttl: DEFAULT_REFERENCE_TTL,
            plans: Arc::new(RwLock::new(None)),
            discount_codes: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_reference_ttl(mut self, ttl: Duration) -> Self {
        self.reference_ttl = ttl;
        self
    }

    /// Raw read of `Sheet!cells`
    pub async fn read(&self, sheet: Sheet, cells: &str) -> SheetsResult<Vec<Vec<String>>> {
        self.sheets.get_values(&sheet.range(cells)).await
    }

    async fn read_row(&self, sheet: Sheet, template: &str, row: usize) -> SheetsResult<Vec<String>> {
        let rows = self.read(sheet, &cols::at(template, row)).await?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    /// First 1-based row of a single-column read where `pred` holds
    async fn find_row(
        &self,
        sheet: Sheet,
        column: &str,
        pred: impl Fn(&str) -> bool,
    ) -> SheetsResult<Option<usize>> {
        let values = self.read(sheet, column).await?;
        Ok(values
            .iter()
            .position(|r| r.first().is_some_and(|v| !v.is_empty() && pred(v)))
            .map(|idx| idx + 1))
    }

    async fn id_at(&self, sheet: Sheet, row: usize) -> SheetsResult<Option<RowRef>> {
        let rows = self.read(sheet, &format!("A{}", row)).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|r| r.into_iter().next())
            .and_then(non_empty)
            .map(|id| RowRef { id, row }))
    }

    pub async fn next_id(&self, sheet: Sheet) -> SheetsResult<String> {
        let prefix = sheet.id_prefix().ok_or_else(|| {
            SheetsError::InvalidRange(format!("{} has no generated IDs", sheet))
        })?;

        let ids = self.read(sheet, "A:A").await?;
        if ids.len() < 2 {
            return Ok(format!("{}_00001", prefix));
        }
        Ok(next_id_from(prefix, &ids))
    }

    /// Allocate the next ID and append the row built from it. Inserts into the
    /// same sheet are serialized within this process.
    pub async fn insert<F>(&self, sheet: Sheet, build: F) -> SheetsResult<String>
    where
        F: FnOnce(&str) -> Row + Send,
    {
        let _guard = self.sheet_locks.lock(sheet.name()).await;

        let id = self.next_id(sheet).await?;
        let row = build(&id);
        self.sheets.append_row(sheet.name(), row).await?;

        tracing::debug!(sheet = %sheet, id = %id, "Appended row");
        Ok(id)
    }

    pub async fn update_cells(&self, sheet: Sheet, cells: &str, values: Row) -> SheetsResult<()> {
        self.sheets.update_values(&sheet.range(cells), values).await
    }

    pub async fn find_customer_by_email(&self, email: &str) -> SheetsResult<Option<RowRef>> {
        let wanted = email.trim().to_lowercase();
        if wanted.is_empty() {
            return Ok(None);
        }

        let row = self
            .find_row(Sheet::Customers, cols::customers::EMAIL, |v| {
                v.trim().to_lowercase() == wanted
            })
            .await?;

        match row {
            Some(row) => self.id_at(Sheet::Customers, row).await,
            None => Ok(None),
        }
    }

    pub async fn customer_record(&self, row: usize) -> SheetsResult<Option<CustomerRecord>> {
        let r = self
            .read_row(Sheet::Customers, cols::customers::RECORD, row)
            .await?;
        if r.is_empty() {
            return Ok(None);
        }

        Ok(Some(CustomerRecord {
            id: cell(&r, 0),
            created_at: cell(&r, 1),
            email: cell(&r, 2),
            phone: cell(&r, 3),
            first_name: cell(&r, 4),
            last_name: cell(&r, 5),
            full_name: cell(&r, 6),
            email_opt_in: cell(&r, 7),
            sms_opt_in: cell(&r, 8),
            shipping_address_id: cell(&r, 9),
            billing_address_id: cell(&r, 10),
        }))
    }

    /// Default shipping (J) and billing (K) address IDs of a customer row
    pub async fn customer_address_ids(
        &self,
        row: usize,
    ) -> SheetsResult<(Option<String>, Option<String>)> {
        let r = self
            .read_row(Sheet::Customers, cols::customers::ADDRESS_IDS, row)
            .await?;
        Ok((non_empty(cell(&r, 0)), non_empty(cell(&r, 1))))
    }

    pub async fn find_address_by_id(&self, address_id: &str) -> SheetsResult<Option<AddressRecord>> {
        let Some(row) = self
            .find_row(Sheet::Addresses, cols::addresses::ID, |v| v == address_id)
            .await?
        else {
            return Ok(None);
        };

        let r = self
            .read_row(Sheet::Addresses, cols::addresses::RECORD, row)
            .await?;
        if r.is_empty() {
            return Ok(None);
        }

        Ok(Some(AddressRecord {
            country: non_empty(cell(&r, 7)).unwrap_or_else(|| "US".to_string()),
            state: cell(&r, 8),
            city: cell(&r, 9),
            zip: cell(&r, 10),
            line1: cell(&r, 11),
            line2: cell(&r, 12),
        }))
    }

    pub async fn find_address_by_customer_and_type(
        &self,
        customer_id: &str,
        kind: AddressKind,
    ) -> SheetsResult<Option<RowRef>> {
        let rows = self
            .read(Sheet::Addresses, cols::addresses::OWNER_AND_TYPE)
            .await?;
        let found = rows
            .iter()
            .position(|r| cell(r, 0) == customer_id && cell(r, 1) == kind.as_str());

        match found {
            Some(idx) => self.id_at(Sheet::Addresses, idx + 1).await,
            None => Ok(None),
        }
    }

    pub async fn find_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> SheetsResult<Option<RowRef>> {
        let row = self
            .find_row(Sheet::Subscriptions, cols::subscriptions::STRIPE_ID, |v| {
                v == stripe_subscription_id
            })
            .await?;

        match row {
            Some(row) => self.id_at(Sheet::Subscriptions, row).await,
            None => Ok(None),
        }
    }

    /// Row of a payment by its `PAY_` ID
    pub async fn find_payment_row(&self, payment_id: &str) -> SheetsResult<Option<usize>> {
        self.find_row(Sheet::Payments, cols::payments::ID, |v| v == payment_id)
            .await
    }

    /// A payment already recorded for this charge with this status
    pub async fn find_payment_by_charge(
        &self,
        charge_id: &str,
        status: &str,
    ) -> SheetsResult<Option<RowRef>> {
        if charge_id.is_empty() {
            return Ok(None);
        }

        // H Status, I Type, J Stripe customer, K Charge
        let rows = self
            .read(Sheet::Payments, cols::payments::STATUS_TO_CHARGE)
            .await?;
        let found = rows
            .iter()
            .position(|r| cell(r, 3) == charge_id && cell(r, 0) == status);

        match found {
            Some(idx) => self.id_at(Sheet::Payments, idx + 1).await,
            None => Ok(None),
        }
    }

    pub async fn find_order_by_external_id(&self, external_id: &str) -> SheetsResult<Option<RowRef>> {
        if external_id.is_empty() {
            return Ok(None);
        }

        let row = self
            .find_row(Sheet::Orders, cols::orders::EXTERNAL_ID, |v| v == external_id)
            .await?;

        match row {
            Some(row) => self.id_at(Sheet::Orders, row).await,
            None => Ok(None),
        }
    }

    async fn cached_table<T, F>(&self, slot: &CacheSlot<T>, sheet: Sheet, cells: &str, parse: F) -> Arc<Vec<T>>
    where
        F: FnOnce(&[Vec<String>]) -> Vec<T>,
    {
        if let Some(cached) = slot.read().await.as_ref() {
            if cached.loaded_at.elapsed() < self.reference_ttl {
                return cached.items.clone();
            }
        }

        match self.read(sheet, cells).await {
            Ok(rows) => {
                let items = Arc::new(parse(&rows));
                tracing::debug!(sheet = %sheet, count = items.len(), "Loaded reference table");
                *slot.write().await = Some(Cached {
                    loaded_at: Instant::now(),
                    items: items.clone(),
                });
                items
            }
            Err(e) => {
                tracing::error!(sheet = %sheet, error = %e, "Failed to load reference table");
                Arc::new(Vec::new())
            }
        }
    }

    pub async fn plans(&self) -> Arc<Vec<Plan>> {
        self.cached_table(&self.plans, Sheet::Plans, cols::plans::TABLE, Plan::parse_table)
            .await
    }

    pub async fn discount_codes(&self) -> Arc<Vec<DiscountCode>> {
        self.cached_table(
            &self.discount_codes,
            Sheet::DiscountCodes,
            cols::discount_codes::TABLE,
            DiscountCode::parse_table,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::InMemorySheets;
    use serde_json::json;

    async fn ledger_with(seed: &[(&str, Vec<Vec<&str>>)]) -> (Ledger, Arc<InMemorySheets>) {
        let sheets = Arc::new(InMemorySheets::new());
        for (name, rows) in seed {
            sheets.seed(name, rows.clone()).await;
        }
        (Ledger::new(sheets.clone()), sheets)
    }

    #[test]
    fn test_next_id_uses_highest_suffix() {
        let ids = vec![
            vec!["ID".to_string()],
            vec!["CUS_00007".to_string()],
            vec!["junk".to_string()],
            vec!["CUS_00003".to_string()],
        ];
        assert_eq!(next_id_from("CUS", &ids), "CUS_00008");
    }

    #[tokio::test]
    async fn test_next_id_header_only_and_foreign_ids() {
        let (ledger, _) = ledger_with(&[
            ("Orders", vec![vec!["Order_ID"]]),
            ("Payments", vec![vec!["Payment_ID"], vec!["legacy-1"]]),
        ])
        .await;

        assert_eq!(ledger.next_id(Sheet::Orders).await.unwrap(), "ORD_00001");
        assert_eq!(ledger.next_id(Sheet::Payments).await.unwrap(), "PAY_00001");
        assert_eq!(ledger.next_id(Sheet::Deliveries).await.unwrap(), "DEL_00001");
        assert!(ledger.next_id(Sheet::Plans).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_get_distinct_ids() {
        let (ledger, sheets) = ledger_with(&[("Deliveries", vec![vec!["Delivery_ID"]])]).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .insert(Sheet::Deliveries, |id| vec![json!(id)])
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        ids.dedup();

        assert_eq!(ids.len(), 10);
        assert_eq!(sheets.rows("Deliveries").await.len(), 11);
    }

    #[tokio::test]
    async fn test_customer_lookup_is_case_insensitive() {
        let (ledger, _) = ledger_with(&[(
            "Customers",
            vec![
                vec!["Customer_ID", "Created_At", "Email"],
                vec!["CUS_00001", "x", "first@example.com"],
                vec!["CUS_00002", "x", "Jane@Example.com", "555", "Jane", "Doe", "Jane Doe", "TRUE", "TRUE", "ADDR_00004", "ADDR_00005"],
            ],
        )])
        .await;

        let found = ledger
            .find_customer_by_email(" jane@example.COM")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, RowRef { id: "CUS_00002".into(), row: 3 });

        let record = ledger.customer_record(found.row).await.unwrap().unwrap();
        assert_eq!(record.first_name, "Jane");
        assert_eq!(record.billing_address_id, "ADDR_00005");

        let ids = ledger.customer_address_ids(found.row).await.unwrap();
        assert_eq!(ids, (Some("ADDR_00004".into()), Some("ADDR_00005".into())));

        assert!(ledger.find_customer_by_email("nobody@example.com").await.unwrap().is_none());
        assert!(ledger.find_customer_by_email("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_address_lookups() {
        let (ledger, _) = ledger_with(&[(
            "Addresses",
            vec![
                vec!["Address_ID", "Customer_ID", "Type"],
                vec!["ADDR_00001", "CUS_00001", "Shipping", "A", "B", "", "", "", "NV", "Las Vegas", "89101", "1 Main St", ""],
                vec!["ADDR_00002", "CUS_00001", "Billing"],
            ],
        )])
        .await;

        let address = ledger.find_address_by_id("ADDR_00001").await.unwrap().unwrap();
        assert_eq!(address.country, "US");
        assert_eq!(address.city, "Las Vegas");
        assert_eq!(address.line1, "1 Main St");

        let billing = ledger
            .find_address_by_customer_and_type("CUS_00001", AddressKind::Billing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(billing, RowRef { id: "ADDR_00002".into(), row: 3 });

        assert!(ledger
            .find_address_by_customer_and_type("CUS_00002", AddressKind::Shipping)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_payment_dedupe_key_is_charge_and_status() {
        let (ledger, _) = ledger_with(&[(
            "Payments",
            vec![
                vec!["Payment_ID", "", "", "", "", "", "", "Status", "Type", "Stripe_Customer", "Charge"],
                vec!["PAY_00001", "", "", "", "", "", "", "Succeeded", "Charge", "cus_1", "ch_1"],
            ],
        )])
        .await;

        let hit = ledger.find_payment_by_charge("ch_1", "Succeeded").await.unwrap();
        assert_eq!(hit.map(|r| r.id).as_deref(), Some("PAY_00001"));
        assert!(ledger.find_payment_by_charge("ch_1", "Refunded").await.unwrap().is_none());
        assert!(ledger.find_payment_by_charge("", "Succeeded").await.unwrap().is_none());
        assert_eq!(ledger.find_payment_row("PAY_00001").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_reference_tables_are_cached() {
        let (ledger, sheets) = ledger_with(&[(
            "Plans (Product_Config - Static)",
            vec![
                vec!["Plan_ID"],
                vec!["PLAN_001", "", "Box", "", "", "", "week", "1", "1"],
            ],
        )])
        .await;

        assert_eq!(ledger.plans().await.len(), 1);
        let reads = sheets.read_count();
        assert_eq!(ledger.plans().await.len(), 1);
        assert_eq!(sheets.read_count(), reads);
    }

    #[tokio::test]
    async fn test_expired_cache_reloads() {
        let (ledger, sheets) = ledger_with(&[("Discount Codes (Static)", vec![vec!["Code_ID"]])]).await;
        let ledger = ledger.with_reference_ttl(Duration::ZERO);

        assert!(ledger.discount_codes().await.is_empty());
        ledger.discount_codes().await;
        assert_eq!(sheets.read_count(), 2);
    }
}
