// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Greens Shared Module
//!
//! The spreadsheet ledger used as the storefront's system of record.
//!
//! ## Features
//!
//! - **Sheets API**: Google Sheets REST client plus an in-memory workbook
//! - **A1 Ranges**: Parsing and formatting of `Sheet!A1:B2` references
//! - **Ledger**: ID allocation, row appends, cell updates and column scans
//! - **Reference Tables**: Cached plan and discount code tables
//! - **Formatting**: Pacific-time date strings and name/address hygiene
//! - **Keyed Locks**: Per-key async serialization (e.g. per email)

pub mod a1;
pub mod discounts;
pub mod error;
pub mod hygiene;
pub mod ledger;
pub mod locks;
pub mod plans;
pub mod sheets;
pub mod timefmt;
pub mod workbook;

pub use a1::{column_index, column_letter, A1Range};
pub use discounts::{DiscountCode, DiscountValidation};
pub use error::{SheetsError, SheetsResult};
pub use ledger::{AddressRecord, CustomerRecord, Ledger, RowRef};
pub use locks::{KeyedGuard, KeyedLocks};
pub use plans::Plan;
pub use sheets::{GoogleSheetsClient, InMemorySheets, Row, SheetsApi, SheetsAuth};
pub use workbook::{AddressKind, Sheet};
