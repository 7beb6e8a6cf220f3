//! A1 notation helpers
//!
//! Ranges look like `Customers!J5:K5`, `Subscriptions!S:S`, `Orders!A5` or just
//! `Payments` (the whole sheet). Rows are 1-based, columns are 0-based indexes
//! internally and letters on the wire.

use std::fmt;

use crate::error::{SheetsError, SheetsResult};

/// Convert a column letter (`A`, `K`, `AA`) into a 0-based index
pub fn column_index(letters: &str) -> SheetsResult<usize> {
    if letters.is_empty() {
        return Err(SheetsError::InvalidRange("empty column".to_string()));
    }

    let mut index = 0usize;
    for ch in letters.chars() {
        if !ch.is_ascii_alphabetic() {
            return Err(SheetsError::InvalidRange(format!(
                "invalid column '{}'",
                letters
            )));
        }
        let value = (ch.to_ascii_uppercase() as u8 - b'A') as usize + 1;
        index = index * 26 + value;
    }

    Ok(index - 1)
}

/// Convert a 0-based column index into its letter form
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// A single corner of a range. `row` is `None` for whole-column references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub col: usize,
    pub row: Option<usize>,
}

impl CellRef {
    fn parse(s: &str) -> SheetsResult<Self> {
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(s.len());
        let (letters, digits) = s.split_at(split);

        let col = column_index(letters)?;
        let row = if digits.is_empty() {
            None
        } else {
            let row: usize = digits
                .parse()
                .map_err(|_| SheetsError::InvalidRange(format!("invalid row in '{}'", s)))?;
            if row == 0 {
                return Err(SheetsError::InvalidRange(format!("row 0 in '{}'", s)));
            }
            Some(row)
        };

        Ok(Self { col, row })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "{}{}", column_letter(self.col), row),
            None => write!(f, "{}", column_letter(self.col)),
        }
    }
}

/// A parsed `Sheet!Start:End` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct A1Range {
    pub sheet: String,
    pub start: Option<CellRef>,
    pub end: Option<CellRef>,
}

impl A1Range {
    pub fn parse(range: &str) -> SheetsResult<Self> {
        let (sheet, cells) = match range.rsplit_once('!') {
            Some((sheet, cells)) => (sheet, Some(cells)),
            None => (range, None),
        };

        let sheet = unquote_sheet(sheet.trim());
        if sheet.is_empty() {
            return Err(SheetsError::InvalidRange(format!(
                "missing sheet name in '{}'",
                range
            )));
        }

        let (start, end) = match cells {
            None => (None, None),
            Some(cells) => {
                let (a, b) = match cells.split_once(':') {
                    Some((a, b)) => (a, b),
                    None => (cells, cells),
                };
                (Some(CellRef::parse(a)?), Some(CellRef::parse(b)?))
            }
        };

        Ok(Self { sheet, start, end })
    }

    pub fn start_col(&self) -> usize {
        self.start.map(|c| c.col).unwrap_or(0)
    }

    /// Inclusive last column, `None` when unbounded
    pub fn end_col(&self) -> Option<usize> {
        self.end.map(|c| c.col)
    }

    pub fn start_row(&self) -> usize {
        self.start.and_then(|c| c.row).unwrap_or(1)
    }

    /// Inclusive last row, `None` when unbounded
    pub fn end_row(&self) -> Option<usize> {
        self.end.and_then(|c| c.row)
    }
}

impl fmt::Display for A1Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start == end => write!(f, "{}!{}", self.sheet, start),
            (Some(start), Some(end)) => write!(f, "{}!{}:{}", self.sheet, start, end),
            _ => write!(f, "{}", self.sheet),
        }
    }
}

fn unquote_sheet(name: &str) -> String {
    if name.len() >= 2 && name.starts_with('\'') && name.ends_with('\'') {
        name[1..name.len() - 1].replace("''", "'")
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_round_trip_boundaries() {
        assert_eq!(column_index("A").unwrap(), 0);
        assert_eq!(column_index("k").unwrap(), 10);
        assert_eq!(column_index("Z").unwrap(), 25);
        assert_eq!(column_index("AA").unwrap(), 26);
        assert_eq!(column_letter(22), "W");
        assert_eq!(column_letter(27), "AB");
        assert!(column_index("A1").is_err());
    }

    #[test]
    fn test_parse_single_cell() {
        let range = A1Range::parse("Subscriptions!D12").unwrap();
        assert_eq!(range.sheet, "Subscriptions");
        assert_eq!(range.start_col(), 3);
        assert_eq!(range.start_row(), 12);
        assert_eq!(range.end_row(), Some(12));
        assert_eq!(range.to_string(), "Subscriptions!D12");
    }

    #[test]
    fn test_parse_whole_column() {
        let range = A1Range::parse("Customers!C:C").unwrap();
        assert_eq!(range.start_row(), 1);
        assert_eq!(range.end_row(), None);
        assert_eq!(range.end_col(), Some(2));
    }

    #[test]
    fn test_parse_sheet_name_with_spaces_and_parens() {
        let range = A1Range::parse("Plans (Product_Config - Static)!A:I").unwrap();
        assert_eq!(range.sheet, "Plans (Product_Config - Static)");
        assert_eq!(range.end_col(), Some(8));
    }

    #[test]
    fn test_parse_quoted_sheet_and_bare_sheet() {
        let quoted = A1Range::parse("'Order Line Items'!A2:I2").unwrap();
        assert_eq!(quoted.sheet, "Order Line Items");
        assert_eq!(quoted.start_row(), 2);

        let bare = A1Range::parse("Payments").unwrap();
        assert_eq!(bare.sheet, "Payments");
        assert!(bare.start.is_none());
        assert_eq!(bare.end_col(), None);
    }

    #[test]
    fn test_rejects_row_zero() {
        assert!(A1Range::parse("Orders!A0").is_err());
    }
}
