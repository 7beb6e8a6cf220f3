//! Discount codes (`Discount Codes (Static)`) and their validation rules

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountCode {
    pub id: String,
    /// Upper-cased for matching
    pub code: String,
    pub code_type: String,
    pub discount_method: String,
    pub discount_value: f64,
    pub currency: String,
    pub applies_to: String,
    pub min_order_value: f64,
    pub start_date: String,
    pub end_date: String,
    pub max_uses_per_customer: Option<u32>,
    pub is_active: bool,
    pub internal_notes: String,
}

/// The fields exposed to the storefront for a valid code
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountSummary {
    pub id: String,
    pub code: String,
    pub code_type: String,
    pub discount_method: String,
    pub discount_value: f64,
    pub applies_to: String,
    pub min_order_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscountValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount: Option<DiscountSummary>,
}

impl DiscountValidation {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
            discount: None,
        }
    }
}

fn cell(row: &[String], idx: usize) -> String {
    row.get(idx).cloned().unwrap_or_default()
}

fn float_or_zero(raw: &str) -> f64 {
    raw.trim().parse().unwrap_or(0.0)
}

impl DiscountCode {
    pub fn from_row(row: &[String]) -> Self {
        Self {
            id: cell(row, 0),
            code: cell(row, 1).trim().to_uppercase(),
            code_type: cell(row, 2),
            discount_method: cell(row, 3),
            discount_value: float_or_zero(&cell(row, 4)),
            currency: cell(row, 5),
            applies_to: cell(row, 6),
            min_order_value: float_or_zero(&cell(row, 7)),
            start_date: cell(row, 8),
            end_date: cell(row, 9),
            max_uses_per_customer: row.get(10).and_then(|v| v.trim().parse().ok()),
            is_active: cell(row, 11).trim().eq_ignore_ascii_case("TRUE"),
            internal_notes: cell(row, 12),
        }
    }

    /// Parse a full table read, header row included
    pub fn parse_table(rows: &[Vec<String>]) -> Vec<Self> {
        rows.iter().skip(1).map(|r| Self::from_row(r)).collect()
    }

    pub fn summary(&self) -> DiscountSummary {
        DiscountSummary {
            id: self.id.clone(),
            code: self.code.clone(),
            code_type: self.code_type.clone(),
            discount_method: self.discount_method.clone(),
            discount_value: self.discount_value,
            applies_to: self.applies_to.clone(),
            min_order_value: self.min_order_value,
        }
    }
}

/// Dates in the sheet are entered by hand; bare dates and naive times are UTC
fn parse_sheet_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }

    tracing::warn!(value = %raw, "Ignoring unparseable discount date");
    None
}

/// Check `code` against the table as of `now`
pub fn validate(
    codes: &[DiscountCode],
    code: Option<&str>,
    order_total: Option<f64>,
    now: DateTime<Utc>,
) -> DiscountValidation {
    let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
        return DiscountValidation::rejected("Code is required");
    };

    let wanted = code.to_uppercase();
    let Some(discount) = codes.iter().find(|d| d.code == wanted) else {
        return DiscountValidation::rejected("Invalid discount code");
    };

    if !discount.is_active {
        return DiscountValidation::rejected("This code is no longer active");
    }

    if let Some(start) = parse_sheet_date(&discount.start_date) {
        if now < start {
            return DiscountValidation::rejected("This code is not yet valid");
        }
    }
    if let Some(end) = parse_sheet_date(&discount.end_date) {
        if now > end {
            return DiscountValidation::rejected("This code has expired");
        }
    }

    if let Some(total) = order_total.filter(|t| *t != 0.0) {
        if discount.min_order_value > 0.0 && total < discount.min_order_value {
            return DiscountValidation::rejected(format!(
                "Minimum order value of ${} required",
                discount.min_order_value
            ));
        }
    }

    DiscountValidation {
        valid: true,
        error: None,
        discount: Some(discount.summary()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn code(cells: &[&str]) -> DiscountCode {
        let row: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
        DiscountCode::from_row(&row)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn table() -> Vec<DiscountCode> {
        vec![
            code(&["DC_1", "welcome10", "Promo", "Percent", "10", "USD", "All", "", "", "", "1", "true"]),
            code(&["DC_2", "OLD", "Promo", "Fixed", "5", "USD", "All", "", "", "2025-01-31", "", "TRUE"]),
            code(&["DC_3", "SOON", "Promo", "Fixed", "5", "USD", "All", "", "07/01/2025", "", "", "TRUE"]),
            code(&["DC_4", "BIG", "Promo", "Fixed", "20", "USD", "All", "50", "", "", "", "TRUE"]),
            code(&["DC_5", "OFF", "Promo", "Fixed", "20", "USD", "All", "", "", "", "", "FALSE"]),
            code(&["DC_6", "WEIRD", "Promo", "Fixed", "1", "USD", "All", "", "someday", "never", "", "TRUE"]),
        ]
    }

    #[test]
    fn test_row_parsing() {
        let c = &table()[0];
        assert_eq!(c.code, "WELCOME10");
        assert_eq!(c.discount_value, 10.0);
        assert_eq!(c.min_order_value, 0.0);
        assert_eq!(c.max_uses_per_customer, Some(1));
        assert!(c.is_active);
    }

    #[test]
    fn test_valid_code_is_case_insensitive() {
        let result = validate(&table(), Some("Welcome10"), Some(30.0), now());
        assert!(result.valid);
        assert_eq!(result.discount.unwrap().code, "WELCOME10");
    }

    #[test]
    fn test_rejection_messages() {
        let codes = table();
        let reason = |c: Option<&str>, total: Option<f64>| validate(&codes, c, total, now()).error;

        assert_eq!(reason(None, None).as_deref(), Some("Code is required"));
        assert_eq!(reason(Some("  "), None).as_deref(), Some("Code is required"));
        assert_eq!(reason(Some("NOPE"), None).as_deref(), Some("Invalid discount code"));
        assert_eq!(reason(Some("off"), None).as_deref(), Some("This code is no longer active"));
        assert_eq!(reason(Some("old"), None).as_deref(), Some("This code has expired"));
        assert_eq!(reason(Some("soon"), None).as_deref(), Some("This code is not yet valid"));
        assert_eq!(
            reason(Some("big"), Some(49.99)).as_deref(),
            Some("Minimum order value of $50 required")
        );
    }

    #[test]
    fn test_minimum_ignored_without_total() {
        assert!(validate(&table(), Some("BIG"), None, now()).valid);
        assert!(validate(&table(), Some("BIG"), Some(0.0), now()).valid);
        assert!(validate(&table(), Some("BIG"), Some(50.0), now()).valid);
    }

    #[test]
    fn test_unparseable_dates_are_ignored() {
        assert!(validate(&table(), Some("weird"), None, now()).valid);
    }

    #[test]
    fn test_serialized_shape() {
        let rejected = serde_json::to_value(validate(&table(), Some("NOPE"), None, now())).unwrap();
        assert_eq!(rejected, serde_json::json!({"valid": false, "error": "Invalid discount code"}));

        let ok = serde_json::to_value(validate(&table(), Some("WELCOME10"), None, now())).unwrap();
        assert_eq!(ok["discount"]["discountMethod"], "Percent");
        assert!(ok.get("error").is_none());
    }
}
