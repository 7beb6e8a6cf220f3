//! Plan catalog rows (`Plans (Product_Config - Static)`)

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// `day`, `week`, `month`, `year` or `none` for one-time products
    pub interval_unit: String,
    pub interval_count: u32,
    pub deliveries_per_cycle: u32,
}

fn count_or_one(cell: Option<&String>) -> u32 {
    cell.and_then(|v| v.trim().parse().ok()).unwrap_or(1)
}

impl Plan {
    /// Parse a data row (columns A..I). Rows without an ID are skipped.
    pub fn from_row(row: &[String]) -> Option<Self> {
        let id = row.first().map(|v| v.trim()).filter(|v| !v.is_empty())?;

        Some(Self {
            id: id.to_string(),
            name: row.get(2).cloned().unwrap_or_default(),
            interval_unit: row.get(6).map(|v| v.trim().to_lowercase()).unwrap_or_default(),
            interval_count: count_or_one(row.get(7)),
            deliveries_per_cycle: count_or_one(row.get(8)),
        })
    }

    /// Parse a full table read, header row included
    pub fn parse_table(rows: &[Vec<String>]) -> Vec<Self> {
        rows.iter().skip(1).filter_map(|r| Self::from_row(r)).collect()
    }

    pub fn is_one_time(&self) -> bool {
        self.interval_unit == "none"
    }

    /// Length of one billing cycle in days (`month` is 30, `year` 365).
    /// A blank unit counts as weekly and a zero count as one.
    pub fn cycle_days(&self) -> u32 {
        let per_unit = match self.interval_unit.as_str() {
            "day" => 1,
            "" | "week" => 7,
            "month" => 30,
            "year" => 365,
            _ => 0,
        };
        per_unit * self.interval_count.max(1)
    }
}
