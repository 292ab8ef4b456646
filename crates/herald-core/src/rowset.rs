//! Raw and canonical tabular results.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::CellValue;

/// One positional row. Column names live on the owning table.
pub type Row = Vec<CellValue>;

/// Tabular result exactly as a source adapter produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RawTable {
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Canonical row set shared by every downstream stage.
///
/// Column names follow the canonical naming convention and are stable for a
/// given endpoint regardless of which adapter produced the rows. Once built a
/// row set is never mutated; filtering produces a new row vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Source-reported refresh time, extracted from the raw data if present.
    pub refreshed_at: Option<String>,
}

impl RowSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, compared case-insensitively.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        column_index(&self.columns, name)
    }

    /// Renders rows as ordered JSON objects keyed by column name.
    #[must_use]
    pub fn records(columns: &[String], rows: &[Row]) -> Vec<IndexMap<String, Value>> {
        rows.iter()
            .map(|row| {
                columns
                    .iter()
                    .zip(row.iter())
                    .map(|(col, cell)| (col.clone(), cell.to_json()))
                    .collect()
            })
            .collect()
    }

    #[must_use]
    pub fn to_records(&self) -> Vec<IndexMap<String, Value>> {
        Self::records(&self.columns, &self.rows)
    }
}

pub(crate) fn column_index(columns: &[String], name: &str) -> Option<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .or_else(|| columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
}
