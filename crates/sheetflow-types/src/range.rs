//! Cell ranges, range keys, and transaction scopes.
//!
//! Ranges use A1 notation on the wire (`Sheet1!A1:C10`, `Sheet1!B2`, or a bare
//! sheet name for the whole sheet) and 0-based inclusive coordinates in memory.
//! A `RangeKey` pins a range to a remote resource and is the unit of version
//! tracking and exclusive locking.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RangeError;

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// Row-major cell values. Rows may be ragged; missing cells read as blank.
pub type Grid = Vec<Vec<Value>>;

static BLANK: Value = Value::Null;

/// A blank cell is `null` or the empty string.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Read a cell from a ragged grid, treating missing cells as blank.
pub fn grid_cell(grid: &Grid, row: usize, col: usize) -> &Value {
    grid.get(row).and_then(|r| r.get(col)).unwrap_or(&BLANK)
}

/// Number of rows and the widest row of a grid.
pub fn grid_dimensions(grid: &Grid) -> (usize, usize) {
    let cols = grid.iter().map(Vec::len).max().unwrap_or(0);
    (grid.len(), cols)
}

// ---------------------------------------------------------------------------
// CellRange
// ---------------------------------------------------------------------------

/// Last addressable row (0-based). Whole-sheet ranges extend to here.
pub const MAX_ROW: u32 = 9_999_999;

/// Last addressable column (0-based, column `ZZZ`).
pub const MAX_COL: u32 = 18_277;

/// A rectangular range on a single sheet.
///
/// Coordinates are 0-based and inclusive on both ends. Serialized as an A1
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellRange {
    pub sheet: String,
    pub start_row: u32,
    pub start_col: u32,
    pub end_row: u32,
    pub end_col: u32,
}

impl CellRange {
    /// Build a range from 0-based inclusive corners, normalizing their order.
    pub fn new(
        sheet: impl Into<String>,
        (r1, c1): (u32, u32),
        (r2, c2): (u32, u32),
    ) -> Self {
        Self {
            sheet: sheet.into(),
            start_row: r1.min(r2),
            start_col: c1.min(c2),
            end_row: r1.max(r2),
            end_col: c1.max(c2),
        }
    }

    /// The whole of a sheet.
    pub fn whole_sheet(sheet: impl Into<String>) -> Self {
        Self::new(sheet, (0, 0), (MAX_ROW, MAX_COL))
    }

    /// Parse A1 notation.
    pub fn parse(a1: &str) -> Result<Self, RangeError> {
        let a1 = a1.trim();
        if a1.is_empty() {
            return Err(RangeError::Empty);
        }

        let (sheet_part, cells) = match a1.rsplit_once('!') {
            Some((sheet, cells)) => (sheet, Some(cells)),
            None => (a1, None),
        };

        let sheet = unquote_sheet(sheet_part);
        if sheet.is_empty() {
            return Err(RangeError::MissingSheet(a1.to_string()));
        }

        let Some(cells) = cells else {
            return Ok(Self::whole_sheet(sheet));
        };

        let (start, end) = match cells.split_once(':') {
            Some((start, end)) => (parse_cell(start)?, parse_cell(end)?),
            None => {
                let cell = parse_cell(cells)?;
                (cell, cell)
            }
        };

        Ok(Self::new(sheet, start, end))
    }

    pub fn is_whole_sheet(&self) -> bool {
        self.start_row == 0
            && self.start_col == 0
            && self.end_row == MAX_ROW
            && self.end_col == MAX_COL
    }

    pub fn row_count(&self) -> u64 {
        u64::from(self.end_row - self.start_row) + 1
    }

    pub fn column_count(&self) -> u64 {
        u64::from(self.end_col - self.start_col) + 1
    }

    pub fn cell_count(&self) -> u64 {
        self.row_count() * self.column_count()
    }

    /// Whether two ranges share at least one cell.
    pub fn overlaps(&self, other: &CellRange) -> bool {
        self.sheet == other.sheet
            && self.start_row <= other.end_row
            && other.start_row <= self.end_row
            && self.start_col <= other.end_col
            && other.start_col <= self.end_col
    }

    /// Whether `other` lies entirely inside this range.
    pub fn contains(&self, other: &CellRange) -> bool {
        self.sheet == other.sheet
            && self.start_row <= other.start_row
            && self.end_row >= other.end_row
            && self.start_col <= other.start_col
            && self.end_col >= other.end_col
    }

    /// Whether an absolute 0-based cell lies in this range.
    pub fn contains_cell(&self, row: u32, col: u32) -> bool {
        (self.start_row..=self.end_row).contains(&row)
            && (self.start_col..=self.end_col).contains(&col)
    }

    pub fn intersection(&self, other: &CellRange) -> Option<CellRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(CellRange {
            sheet: self.sheet.clone(),
            start_row: self.start_row.max(other.start_row),
            start_col: self.start_col.max(other.start_col),
            end_row: self.end_row.min(other.end_row),
            end_col: self.end_col.min(other.end_col),
        })
    }

    /// A1 reference (without sheet) for an absolute 0-based cell.
    pub fn cell_ref(row: u32, col: u32) -> String {
        format!("{}{}", column_letters(col), row + 1)
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sheet = quote_sheet(&self.sheet);
        if self.is_whole_sheet() {
            return write!(f, "{sheet}");
        }
        let start = Self::cell_ref(self.start_row, self.start_col);
        if self.start_row == self.end_row && self.start_col == self.end_col {
            write!(f, "{sheet}!{start}")
        } else {
            let end = Self::cell_ref(self.end_row, self.end_col);
            write!(f, "{sheet}!{start}:{end}")
        }
    }
}

impl TryFrom<String> for CellRange {
    type Error = RangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CellRange> for String {
    fn from(range: CellRange) -> Self {
        range.to_string()
    }
}

impl std::str::FromStr for CellRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// A1 helpers
// ---------------------------------------------------------------------------

/// Convert a 0-based column index to letters (`0 -> A`, `26 -> AA`).
pub fn column_letters(col: u32) -> String {
    let mut n = col + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push(b'A' + rem);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

fn parse_cell(cell: &str) -> Result<(u32, u32), RangeError> {
    let cell = cell.trim().trim_start_matches('$');
    let split = cell
        .find(|c: char| c.is_ascii_digit() || c == '$')
        .ok_or_else(|| RangeError::InvalidCell(cell.to_string()))?;
    let (letters, digits) = cell.split_at(split);
    let digits = digits.trim_start_matches('$');

    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(RangeError::InvalidCell(cell.to_string()));
    }

    let mut col: u32 = 0;
    for c in letters.chars() {
        let value = u32::from(c.to_ascii_uppercase() as u8 - b'A') + 1;
        col = col
            .checked_mul(26)
            .and_then(|v| v.checked_add(value))
            .ok_or_else(|| RangeError::OutOfBounds(cell.to_string()))?;
    }
    let col = col - 1;

    let row: u32 = digits
        .parse()
        .map_err(|_| RangeError::InvalidCell(cell.to_string()))?;
    if row == 0 {
        return Err(RangeError::InvalidCell(cell.to_string()));
    }
    let row = row - 1;

    if row > MAX_ROW || col > MAX_COL {
        return Err(RangeError::OutOfBounds(cell.to_string()));
    }

    Ok((row, col))
}

fn unquote_sheet(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        raw[1..raw.len() - 1].replace("''", "'")
    } else {
        raw.to_string()
    }
}

fn quote_sheet(sheet: &str) -> String {
    if sheet.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        sheet.to_string()
    } else {
        format!("'{}'", sheet.replace('\'', "''"))
    }
}

// ---------------------------------------------------------------------------
// RangeKey
// ---------------------------------------------------------------------------

/// A range on a specific remote resource (spreadsheet).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeKey {
    pub resource_id: String,
    pub range: CellRange,
}

impl RangeKey {
    pub fn new(resource_id: impl Into<String>, range: CellRange) -> Self {
        Self {
            resource_id: resource_id.into(),
            range,
        }
    }

    /// Parse the range part from A1 notation.
    pub fn parse(resource_id: impl Into<String>, a1: &str) -> Result<Self, RangeError> {
        Ok(Self::new(resource_id, CellRange::parse(a1)?))
    }

    pub fn overlaps(&self, other: &RangeKey) -> bool {
        self.resource_id == other.resource_id && self.range.overlaps(&other.range)
    }

    pub fn contains(&self, other: &RangeKey) -> bool {
        self.resource_id == other.resource_id && self.range.contains(&other.range)
    }

    pub fn sheet(&self) -> &str {
        &self.range.sheet
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.range)
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The set of ranges a transaction declares it will touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub ranges: Vec<RangeKey>,
}

impl Scope {
    pub fn new(ranges: Vec<RangeKey>) -> Self {
        Self { ranges }
    }

    pub fn single(key: RangeKey) -> Self {
        Self { ranges: vec![key] }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn overlaps(&self, other: &Scope) -> bool {
        self.ranges
            .iter()
            .any(|a| other.ranges.iter().any(|b| a.overlaps(b)))
    }

    /// Whether `key` is fully covered by a single declared range.
    pub fn covers(&self, key: &RangeKey) -> bool {
        self.ranges.iter().any(|r| r.contains(key))
    }

    /// Add a range unless an existing range already covers it.
    pub fn widen(&mut self, key: &RangeKey) {
        if !self.covers(key) {
            self.ranges.push(key.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_full_range() {
        let r = CellRange::parse("Sheet1!A1:C10").unwrap();
        assert_eq!(r.sheet, "Sheet1");
        assert_eq!((r.start_row, r.start_col), (0, 0));
        assert_eq!((r.end_row, r.end_col), (9, 2));
        assert_eq!(r.cell_count(), 30);
        assert_eq!(r.to_string(), "Sheet1!A1:C10");
    }

    #[test]
    fn parse_single_cell_and_reversed_corners() {
        let single = CellRange::parse("Data!B2").unwrap();
        assert_eq!(single.cell_count(), 1);
        assert_eq!(single.to_string(), "Data!B2");

        let reversed = CellRange::parse("Data!C3:A1").unwrap();
        assert_eq!(reversed.to_string(), "Data!A1:C3");
    }

    #[test]
    fn parse_quoted_sheet_and_absolute_refs() {
        let r = CellRange::parse("'Q1 Budget'!$A$1:$B$2").unwrap();
        assert_eq!(r.sheet, "Q1 Budget");
        assert_eq!(r.to_string(), "'Q1 Budget'!A1:B2");
    }

    #[test]
    fn parse_whole_sheet() {
        let r = CellRange::parse("Summary").unwrap();
        assert!(r.is_whole_sheet());
        assert_eq!(r.to_string(), "Summary");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(CellRange::parse(""), Err(RangeError::Empty)));
        assert!(matches!(
            CellRange::parse("Sheet1!11"),
            Err(RangeError::InvalidCell(_))
        ));
        assert!(matches!(
            CellRange::parse("Sheet1!A0"),
            Err(RangeError::InvalidCell(_))
        ));
        assert!(matches!(
            CellRange::parse("!A1"),
            Err(RangeError::MissingSheet(_))
        ));
    }

    #[test]
    fn column_letters_roundtrip_points() {
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
        assert_eq!(column_letters(26), "AA");
        assert_eq!(column_letters(701), "ZZ");
        assert_eq!(column_letters(MAX_COL), "ZZZ");
    }

    #[test]
    fn overlap_and_containment() {
        let a = CellRange::parse("S!A1:C3").unwrap();
        let b = CellRange::parse("S!C3:D4").unwrap();
        let c = CellRange::parse("S!D4:E5").unwrap();
        let other_sheet = CellRange::parse("T!A1:C3").unwrap();

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&other_sheet));
        assert_eq!(a.intersection(&b).unwrap().to_string(), "S!C3");

        let whole = CellRange::whole_sheet("S");
        assert!(whole.contains(&a));
        assert!(whole.overlaps(&c));
        assert!(!a.contains(&b));
    }

    #[test]
    fn range_key_requires_same_resource() {
        let a = RangeKey::parse("book-1", "S!A1:B2").unwrap();
        let b = RangeKey::parse("book-2", "S!A1:B2").unwrap();
        assert!(!a.overlaps(&b));
        assert_eq!(a.to_string(), "book-1/S!A1:B2");
    }

    #[test]
    fn scope_overlap_and_widen() {
        let mut scope = Scope::single(RangeKey::parse("book", "S!A1:D10").unwrap());
        let inner = RangeKey::parse("book", "S!B2:C3").unwrap();
        let outside = RangeKey::parse("book", "S!Z1").unwrap();

        assert!(scope.covers(&inner));
        scope.widen(&inner);
        assert_eq!(scope.ranges.len(), 1);

        scope.widen(&outside);
        assert_eq!(scope.ranges.len(), 2);

        let other = Scope::single(RangeKey::parse("book", "S!Z1:Z5").unwrap());
        assert!(scope.overlaps(&other));
    }

    #[test]
    fn serde_uses_a1_strings() {
        let key = RangeKey::parse("book", "S!A1:B2").unwrap();
        let value = serde_json::to_value(&key).unwrap();
        assert_eq!(value, json!({ "resource_id": "book", "range": "S!A1:B2" }));

        let parsed: RangeKey = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, key);

        let bad: Result<RangeKey, _> =
            serde_json::from_value(json!({ "resource_id": "book", "range": "S!??" }));
        assert!(bad.is_err());
    }

    #[test]
    fn blank_and_ragged_grid_access() {
        let grid: Grid = vec![vec![json!(1), json!("")], vec![json!(null)]];
        assert!(!is_blank(grid_cell(&grid, 0, 0)));
        assert!(is_blank(grid_cell(&grid, 0, 1)));
        assert!(is_blank(grid_cell(&grid, 1, 1)));
        assert!(is_blank(grid_cell(&grid, 5, 5)));
        assert_eq!(grid_dimensions(&grid), (2, 2));
    }
}
