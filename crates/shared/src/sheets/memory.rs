//! In-memory workbook
//!
//! Mirrors the parts of the Sheets API the ledger relies on: formatted reads
//! with trailing blanks trimmed, appends after the last populated row, and
//! `USER_ENTERED` value rendering (a leading `'` forces text and is dropped).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Row, SheetsApi};
use crate::a1::A1Range;
use crate::error::SheetsResult;

#[derive(Default)]
pub struct InMemorySheets {
    sheets: Mutex<HashMap<String, Vec<Vec<String>>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl InMemorySheets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a sheet's contents (header row included)
    pub async fn seed(&self, sheet: &str, rows: Vec<Vec<&str>>) {
        let rows = rows
            .into_iter()
            .map(|r| r.into_iter().map(str::to_string).collect())
            .collect();
        self.sheets.lock().await.insert(sheet.to_string(), rows);
    }

    /// Snapshot of a sheet as stored
    pub async fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.sheets
            .lock()
            .await
            .get(sheet)
            .cloned()
            .unwrap_or_default()
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// Render a cell the way Sheets displays a `USER_ENTERED` value
pub(crate) fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::Bool(true) => "TRUE".to_string(),
        serde_json::Value::Bool(false) => "FALSE".to_string(),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                let v = n.as_f64().unwrap_or_default();
                if v.fract() == 0.0 && v.abs() < 1e15 {
                    format!("{}", v as i64)
                } else {
                    v.to_string()
                }
            }
        }
        serde_json::Value::String(s) => s.strip_prefix('\'').unwrap_or(s).to_string(),
        other => other.to_string(),
    }
}

fn trim_trailing_blanks(row: &mut Vec<String>) {
    while row.last().is_some_and(|c| c.is_empty()) {
        row.pop();
    }
}

fn last_populated_row(rows: &[Vec<String>]) -> usize {
    rows.iter()
        .rposition(|r| r.iter().any(|c| !c.is_empty()))
        .map(|i| i + 1)
        .unwrap_or(0)
}

#[async_trait]
impl SheetsApi for InMemorySheets {
    async fn get_values(&self, range: &str) -> SheetsResult<Vec<Vec<String>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let range = A1Range::parse(range)?;
        let sheets = self.sheets.lock().await;
        let Some(rows) = sheets.get(&range.sheet) else {
            return Ok(Vec::new());
        };

        let first = range.start_row() - 1;
        let last = range.end_row().unwrap_or(rows.len()).min(rows.len());
        if first >= last {
            return Ok(Vec::new());
        }

        let start_col = range.start_col();
        let mut out: Vec<Vec<String>> = rows[first..last]
            .iter()
            .map(|row| {
                let end = match range.end_col() {
                    Some(end_col) => (end_col + 1).min(row.len()),
                    None => row.len(),
                };
                let mut cells = if start_col < end {
                    row[start_col..end].to_vec()
                } else {
                    Vec::new()
                };
                trim_trailing_blanks(&mut cells);
                cells
            })
            .collect();

        while out.last().is_some_and(|r| r.is_empty()) {
            out.pop();
        }

        Ok(out)
    }

    async fn append_row(&self, sheet: &str, row: Row) -> SheetsResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let range = A1Range::parse(sheet)?;
        let mut sheets = self.sheets.lock().await;
        let rows = sheets.entry(range.sheet).or_default();

        let at = last_populated_row(rows);
        rows.truncate(at);
        rows.push(row.iter().map(render_cell).collect());
        Ok(())
    }

    async fn update_values(&self, range: &str, row: Row) -> SheetsResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let range = A1Range::parse(range)?;
        let mut sheets = self.sheets.lock().await;
        let rows = sheets.entry(range.sheet.clone()).or_default();

        let row_idx = range.start_row() - 1;
        if rows.len() <= row_idx {
            rows.resize(row_idx + 1, Vec::new());
        }

        let target = &mut rows[row_idx];
        let start_col = range.start_col();
        if target.len() < start_col + row.len() {
            target.resize(start_col + row.len(), String::new());
        }
        for (offset, value) in row.iter().enumerate() {
            target[start_col + offset] = render_cell(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_column_read_keeps_row_alignment() {
        let sheets = InMemorySheets::new();
        sheets
            .seed(
                "Customers",
                vec![
                    vec!["ID", "Created", "Email"],
                    vec!["CUS_00001", "", ""],
                    vec!["CUS_00002", "", "b@example.com"],
                ],
            )
            .await;

        let emails = sheets.get_values("Customers!C:C").await.unwrap();
        assert_eq!(emails.len(), 3);
        assert_eq!(emails[0], vec!["Email"]);
        assert!(emails[1].is_empty());
        assert_eq!(emails[2], vec!["b@example.com"]);
    }

    #[tokio::test]
    async fn test_append_renders_user_entered_values() {
        let sheets = InMemorySheets::new();
        sheets
            .append_row(
                "Payments",
                vec![json!("PAY_00001"), json!("'2025-01-01T10:00:00"), json!(12.5), json!(0), json!(true)],
            )
            .await
            .unwrap();

        let rows = sheets.rows("Payments").await;
        assert_eq!(
            rows[0],
            vec!["PAY_00001", "2025-01-01T10:00:00", "12.5", "0", "TRUE"]
        );
    }

    #[tokio::test]
    async fn test_append_lands_after_last_populated_row() {
        let sheets = InMemorySheets::new();
        sheets.seed("Orders", vec![vec!["ID"], vec!["ORD_00001"]]).await;
        sheets
            .update_values("Orders!A6", vec![json!("")])
            .await
            .unwrap();

        sheets
            .append_row("Orders", vec![json!("ORD_00002")])
            .await
            .unwrap();

        let ids = sheets.get_values("Orders!A:A").await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[2], vec!["ORD_00002"]);
    }

    #[tokio::test]
    async fn test_update_writes_block_at_offset() {
        let sheets = InMemorySheets::new();
        sheets
            .seed("Customers", vec![vec!["ID"], vec!["CUS_00001", "x", "a@b.c"]])
            .await;

        sheets
            .update_values("Customers!J2:K2", vec![json!("ADDR_00001"), json!("ADDR_00002")])
            .await
            .unwrap();

        let ids = sheets.get_values("Customers!J2:K2").await.unwrap();
        assert_eq!(ids, vec![vec!["ADDR_00001", "ADDR_00002"]]);

        let full = sheets.get_values("Customers!A2:K2").await.unwrap();
        assert_eq!(full[0].len(), 11);
        assert_eq!(full[0][3], "");
    }

    #[tokio::test]
    async fn test_missing_sheet_reads_empty() {
        let sheets = InMemorySheets::new();
        assert!(sheets.get_values("Deliveries!A:A").await.unwrap().is_empty());
    }

    #[test]
    fn test_render_whole_floats_without_fraction() {
        assert_eq!(render_cell(&json!(30.0)), "30");
        assert_eq!(render_cell(&json!(-4.99)), "-4.99");
        assert_eq!(render_cell(&serde_json::Value::Null), "");
    }
}
