//! Sheets API seam
//!
//! The ledger talks to the workbook through [`SheetsApi`]. Production uses
//! [`GoogleSheetsClient`]; tests and local development use [`InMemorySheets`].

mod google;
mod memory;

use async_trait::async_trait;

use crate::error::SheetsResult;

pub use google::{GoogleSheetsClient, ServiceAccountKey, SheetsAuth};
pub use memory::InMemorySheets;

/// A row of cells as written with `USER_ENTERED` semantics
pub type Row = Vec<serde_json::Value>;

#[async_trait]
pub trait SheetsApi: Send + Sync {
    /// Read formatted values. Interior blank rows come back as empty vectors so
    /// `index + range.start_row()` is always the sheet row.
    async fn get_values(&self, range: &str) -> SheetsResult<Vec<Vec<String>>>;

    /// Append a row after the last row holding data
    async fn append_row(&self, sheet: &str, row: Row) -> SheetsResult<()>;

    /// Overwrite cells starting at the top-left of `range`
    async fn update_values(&self, range: &str, row: Row) -> SheetsResult<()>;
}
