//! Date strings written to the workbook
//!
//! All dates are rendered in the storefront's local time (Pacific). ISO
//! values carry a leading apostrophe so Sheets keeps them as text instead of
//! reparsing them in the spreadsheet's locale.

use chrono::{DateTime, Days, LocalResult, Months, NaiveDateTime, TimeZone, Utc};
use chrono_tz::America::Los_Angeles;
use chrono_tz::Tz;

pub const STORE_TZ: Tz = Los_Angeles;

fn local(ts: i64) -> Option<DateTime<Tz>> {
    if ts == 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp(ts, 0).map(|utc| utc.with_timezone(&STORE_TZ))
}

/// `'2025-11-05T14:03:07`, empty for a missing or zero timestamp
pub fn format_iso_date(ts: Option<i64>) -> String {
    ts.and_then(local)
        .map(|dt| format!("'{}", dt.format("%Y-%m-%dT%H:%M:%S")))
        .unwrap_or_default()
}

/// `November 5, 2025`, empty for a missing or zero timestamp
pub fn format_human_date(ts: Option<i64>) -> String {
    ts.and_then(local)
        .map(|dt| dt.format("%B %-d, %Y").to_string())
        .unwrap_or_default()
}

/// Current time as an ISO cell value
pub fn now_iso() -> String {
    format_iso_date(Some(Utc::now().timestamp()))
}

/// Calendar arithmetic in store-local time. Unknown units leave `ts` as is.
pub fn add_interval(ts: i64, unit: &str, count: u32) -> i64 {
    let Some(start) = DateTime::<Utc>::from_timestamp(ts, 0) else {
        return ts;
    };
    let naive = start.with_timezone(&STORE_TZ).naive_local();

    let shifted: Option<NaiveDateTime> = match unit {
        "day" => naive.checked_add_days(Days::new(u64::from(count))),
        "week" => naive.checked_add_days(Days::new(u64::from(count) * 7)),
        "month" => naive.checked_add_months(Months::new(count)),
        "year" => count
            .checked_mul(12)
            .and_then(|months| naive.checked_add_months(Months::new(months))),
        _ => None,
    };

    let Some(shifted) = shifted else {
        return ts;
    };

    match STORE_TZ.from_local_datetime(&shifted) {
        LocalResult::Single(dt) => dt.timestamp(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp(),
        // Spring-forward gap: the wall-clock hour does not exist, keep elapsed time instead
        LocalResult::None => ts + (shifted - naive).num_seconds(),
    }
}
