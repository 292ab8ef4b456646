//! Raw table to canonical row set conversion.
//!
//! Canonical column names are ASCII lowerCamelCase. Names that are already
//! lowerCamelCase pass through untouched; anything else is transliterated,
//! split on non-alphanumerics and re-joined. Identifier-like columns (agency
//! codes and similar) are coerced to text so that `42`, `42.0` and `"42"` from
//! different backends compare equal. A refresh timestamp column, when present,
//! moves into [`RowSet::refreshed_at`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::HeraldError;
use crate::rowset::{RawTable, Row, RowSet};
use crate::value::CellValue;

/// Tunables for the [`Normalizer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerOptions {
    /// Simplified column names (lowercase letters only) treated as identifiers.
    pub identifier_columns: Vec<String>,
    /// Simplified prefixes that also mark a column as an identifier.
    pub identifier_prefixes: Vec<String>,
    /// Left-pad purely numeric identifiers with zeros to this width.
    pub identifier_width: Option<usize>,
    /// Simplified name of the column carrying the source refresh time.
    pub refresh_column: String,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            identifier_columns: [
                "agency",
                "agencycode",
                "agencyid",
                "acentekodu",
                "acente",
                "acenteid",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            identifier_prefixes: vec!["agency".into(), "acente".into()],
            identifier_width: None,
            refresh_column: "datarefreshtime".into(),
        }
    }
}

/// Deterministic raw-to-canonical transformation.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    options: NormalizerOptions,
}

impl Normalizer {
    pub fn new(options: NormalizerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &NormalizerOptions {
        &self.options
    }

    /// Width numeric identifiers are zero-padded to, if any.
    #[must_use]
    pub fn identifier_width(&self) -> Option<usize> {
        self.options.identifier_width
    }

    /// Normalizes a raw adapter result.
    ///
    /// Fails only when a row's width differs from the header width.
    pub fn normalize(&self, raw: RawTable) -> Result<RowSet, HeraldError> {
        let width = raw.columns.len();
        if let Some((idx, row)) = raw.rows.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(HeraldError::normalization(format!(
                "row {idx} has {} cells, expected {width}",
                row.len()
            )));
        }

        let RawTable {
            mut columns,
            mut rows,
        } = raw;

        let mut refreshed_at = None;
        if let Some(pos) = columns
            .iter()
            .position(|c| simplify(c) == self.options.refresh_column)
        {
            refreshed_at = rows
                .first()
                .map(|r| &r[pos])
                .filter(|cell| !cell.is_null())
                .map(ToString::to_string);
            columns.remove(pos);
            for row in &mut rows {
                row.remove(pos);
            }
            debug!(refreshed_at = ?refreshed_at, "extracted refresh column");
        }

        let identifier_positions: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| self.is_identifier_column(c))
            .map(|(i, _)| i)
            .collect();
        if !identifier_positions.is_empty() {
            for row in &mut rows {
                self.coerce_identifiers(row, &identifier_positions);
            }
        }

        Ok(RowSet {
            columns: canonical_columns(&columns),
            rows,
            refreshed_at,
        })
    }

    /// Whether values of `column` are coerced to identifier text.
    ///
    /// Accepts source spellings and canonical names alike.
    #[must_use]
    pub fn is_identifier_column(&self, column: &str) -> bool {
        let simplified = simplify(column);
        self.options.identifier_columns.contains(&simplified)
            || self
                .options
                .identifier_prefixes
                .iter()
                .any(|p| simplified.starts_with(p.as_str()))
    }

    fn coerce_identifiers(&self, row: &mut Row, positions: &[usize]) {
        for &pos in positions {
            let text = match &row[pos] {
                CellValue::Null => continue,
                CellValue::Integer(i) => i.to_string(),
                CellValue::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => {
                    format!("{}", *f as i64)
                }
                CellValue::Text(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            row[pos] = CellValue::Text(self.pad(text));
        }
    }

    fn pad(&self, text: String) -> String {
        match self.options.identifier_width {
            Some(width)
                if text.len() < width
                    && !text.is_empty()
                    && text.bytes().all(|b| b.is_ascii_digit()) =>
            {
                format!("{text:0>width$}")
            }
            _ => text,
        }
    }
}

/// Lowercase ASCII letters only, used to recognize special columns.
#[must_use]
pub fn simplify(column: &str) -> String {
    column
        .to_lowercase()
        .chars()
        .filter(char::is_ascii_lowercase)
        .collect()
}

/// Converts a column name into the canonical lowerCamelCase form.
#[must_use]
pub fn canonical_column_name(raw: &str) -> String {
    if is_lower_camel_case(raw) && raw.is_ascii() {
        return raw.to_string();
    }
    let ascii = transliterate(raw);
    let mut parts = ascii
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|p| !p.is_empty());
    let Some(head) = parts.next() else {
        return raw.to_string();
    };
    let mut out = head.to_ascii_lowercase();
    for part in parts {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars.map(|c| c.to_ascii_lowercase()));
        }
    }
    out
}

fn canonical_columns(columns: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    columns
        .iter()
        .map(|c| {
            let base = canonical_column_name(c);
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.clone()) {
                name = format!("{base}{n}");
                n += 1;
            }
            name
        })
        .collect()
}

fn is_lower_camel_case(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_lowercase())
        && chars.clone().any(char::is_uppercase)
        && chars.all(char::is_alphanumeric)
}

fn transliterate(value: &str) -> String {
    value
        .chars()
        .filter_map(|c| match c {
            'ç' => Some('c'),
            'Ç' => Some('C'),
            'ğ' => Some('g'),
            'Ğ' => Some('G'),
            'ı' => Some('i'),
            'İ' => Some('I'),
            'ö' | 'ó' | 'ò' | 'ô' => Some('o'),
            'Ö' | 'Ó' | 'Ò' | 'Ô' => Some('O'),
            'ş' => Some('s'),
            'Ş' => Some('S'),
            'ü' | 'ú' | 'ù' | 'û' => Some('u'),
            'Ü' | 'Ú' | 'Ù' | 'Û' => Some('U'),
            'á' | 'à' | 'â' | 'ä' => Some('a'),
            'Á' | 'À' | 'Â' | 'Ä' => Some('A'),
            'é' | 'è' | 'ê' | 'ë' => Some('e'),
            'É' | 'È' | 'Ê' | 'Ë' => Some('E'),
            'í' | 'ì' | 'î' | 'ï' => Some('i'),
            c if c.is_ascii() => Some(c),
            _ => None,
        })
        .collect()
}
