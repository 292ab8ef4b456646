//! Request filters and their evaluation.
//!
//! A [`FilterSet`] is the raw `key -> value` map taken from the request. It is
//! resolved against the endpoint's declared fields into a [`PredicateSet`],
//! which is then either translated into backend constraints by a source
//! adapter or evaluated here by [`InMemoryEvaluator`]. Both paths compare
//! text case-insensitively so a response does not depend on the tier that
//! served it.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::HeraldError;
use crate::normalize::canonical_column_name;
use crate::rowset::{RowSet, column_index};
use crate::value::CellValue;

/// Request filters, keyed by the name the caller used.
///
/// Empty values are dropped on insert; an empty filter constrains nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet(BTreeMap<String, String>);

impl FilterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if !value.trim().is_empty() {
            self.0.insert(key.into(), value);
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates filters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Resolves every key against the endpoint's declared fields.
    ///
    /// A key is first looked up verbatim; otherwise an operator suffix
    /// (`_gte`, `_in`, `_start`, ...) is split off and the remainder must be
    /// declared. Anything left over is handled per `policy`.
    pub fn resolve(
        &self,
        endpoint: &str,
        fields: &IndexMap<String, FilterField>,
        policy: UnknownFilterPolicy,
    ) -> Result<PredicateSet, HeraldError> {
        let mut resolved = PredicateSet::default();
        for (key, value) in self.iter() {
            let lookup = fields
                .get_key_value(key)
                .map(|(k, f)| (k, f, None))
                .or_else(|| {
                    FilterOp::split_suffix(key).and_then(|(base, op)| {
                        fields.get_key_value(base).map(|(k, f)| (k, f, Some(op)))
                    })
                });

            match lookup {
                Some((declared, field, op)) => {
                    let op = op.unwrap_or(match field.matching {
                        FieldMatch::Equals => FilterOp::Eq,
                        FieldMatch::Contains => FilterOp::Contains,
                    });
                    resolved.predicates.push(Predicate {
                        key: declared.clone(),
                        column: field.column.clone(),
                        report_filter: field.report_filter.clone(),
                        op,
                        value: value.trim().to_string(),
                    });
                }
                None => match policy {
                    UnknownFilterPolicy::Reject => {
                        return Err(HeraldError::filter_key_unknown(endpoint, key));
                    }
                    UnknownFilterPolicy::MatchNothing => resolved.unknown.push(key.to_string()),
                },
            }
        }
        Ok(resolved)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FilterSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut set = Self::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

/// How an undeclared filter key is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownFilterPolicy {
    /// Fail the request with `FilterKeyUnknown`.
    #[default]
    Reject,
    /// Accept the request and return no rows.
    MatchNothing,
}

/// Default comparison for a declared field when no operator suffix is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldMatch {
    #[default]
    Equals,
    Contains,
}

/// One declared filter field of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterField {
    /// Canonical column the filter applies to (relational and in-memory paths).
    #[serde(default)]
    pub column: Option<String>,
    /// Report filter identifier (report path).
    #[serde(default)]
    pub report_filter: Option<String>,
    #[serde(default)]
    pub matching: FieldMatch,
}

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Case-insensitive substring match.
    Contains,
    /// Comma-separated list of accepted values.
    In,
}

impl FilterOp {
    const SUFFIXES: [(&'static str, FilterOp); 9] = [
        ("_start", FilterOp::Gte),
        ("_end", FilterOp::Lte),
        ("_gte", FilterOp::Gte),
        ("_lte", FilterOp::Lte),
        ("_like", FilterOp::Contains),
        ("_ne", FilterOp::Ne),
        ("_gt", FilterOp::Gt),
        ("_lt", FilterOp::Lt),
        ("_in", FilterOp::In),
    ];

    /// Splits an operator suffix off a request key.
    #[must_use]
    pub fn split_suffix(key: &str) -> Option<(&str, FilterOp)> {
        Self::SUFFIXES.iter().find_map(|(suffix, op)| {
            key.strip_suffix(suffix)
                .filter(|base| !base.is_empty())
                .map(|base| (base, *op))
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Contains => "contains",
            Self::In => "in",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved filter condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    /// Declared field key the request key resolved to.
    pub key: String,
    pub column: Option<String>,
    pub report_filter: Option<String>,
    pub op: FilterOp,
    pub value: String,
}

impl Predicate {
    /// Values of the predicate; `In` splits on commas.
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        match self.op {
            FilterOp::In => self
                .value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .collect(),
            _ => vec![self.value.as_str()],
        }
    }

    /// Column the predicate targets, falling back to the declared key.
    #[must_use]
    pub fn target_column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.key)
    }

    /// Evaluates the predicate against a single cell. Nulls never match.
    #[must_use]
    pub fn matches(&self, cell: &CellValue) -> bool {
        if cell.is_null() {
            return false;
        }
        match self.op {
            FilterOp::Eq => text_eq(cell, &self.value),
            FilterOp::Ne => !text_eq(cell, &self.value),
            FilterOp::Contains => cell
                .to_string()
                .to_lowercase()
                .contains(&self.value.to_lowercase()),
            FilterOp::In => self.values().into_iter().any(|v| text_eq(cell, v)),
            FilterOp::Gt => compare(cell, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(cell, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(cell, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(cell, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

/// Predicates resolved for one request, AND-combined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredicateSet {
    pub predicates: Vec<Predicate>,
    /// Undeclared keys accepted under [`UnknownFilterPolicy::MatchNothing`].
    pub unknown: Vec<String>,
}

impl PredicateSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty() && self.unknown.is_empty()
    }

    /// True when the request can never match a row.
    #[must_use]
    pub fn matches_nothing(&self) -> bool {
        !self.unknown.is_empty()
    }
}

/// Applies resolved predicates to a canonical row set.
///
/// The in-memory implementation does the actual filtering; the pushdown
/// implementation trusts that the backend already applied the constraints.
pub trait FilterEvaluator: Send + Sync {
    fn apply(&self, rows: RowSet, predicates: &PredicateSet) -> RowSet;
}

/// Evaluates predicates row by row.
///
/// Columns are looked up as declared, then by their canonical name, so a
/// field mapped to `region_name` finds the normalized `regionName`. A
/// predicate whose column is absent from the row set matches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryEvaluator;

impl FilterEvaluator for InMemoryEvaluator {
    fn apply(&self, mut rows: RowSet, predicates: &PredicateSet) -> RowSet {
        if predicates.matches_nothing() {
            rows.rows.clear();
            return rows;
        }
        if predicates.predicates.is_empty() {
            return rows;
        }

        let mut bound = Vec::with_capacity(predicates.predicates.len());
        for predicate in &predicates.predicates {
            let target = predicate.target_column();
            let idx = column_index(&rows.columns, target)
                .or_else(|| column_index(&rows.columns, &canonical_column_name(target)));
            match idx {
                Some(idx) => bound.push((idx, predicate)),
                None => {
                    tracing::debug!(
                        column = predicate.target_column(),
                        "filter column missing from dataset, no rows match"
                    );
                    rows.rows.clear();
                    return rows;
                }
            }
        }

        rows.rows
            .retain(|row| bound.iter().all(|(idx, p)| p.matches(&row[*idx])));
        rows
    }
}

/// Evaluator for rows the backend already filtered.
#[derive(Debug, Clone, Copy, Default)]
pub struct PushedDownEvaluator;

impl FilterEvaluator for PushedDownEvaluator {
    fn apply(&self, mut rows: RowSet, predicates: &PredicateSet) -> RowSet {
        if predicates.matches_nothing() {
            rows.rows.clear();
        }
        rows
    }
}

fn text_eq(cell: &CellValue, value: &str) -> bool {
    if cell.to_string().to_lowercase() == value.to_lowercase() {
        return true;
    }
    match (cell, value.trim().parse::<f64>()) {
        (CellValue::Integer(_) | CellValue::Float(_), Ok(v)) => cell.as_f64() == Some(v),
        _ => false,
    }
}

fn compare(cell: &CellValue, value: &str) -> Option<Ordering> {
    match cell {
        CellValue::Timestamp(ts) => parse_timestamp(value).map(|v| ts.cmp(&v)),
        CellValue::Integer(_) | CellValue::Float(_) => {
            let v = value.trim().parse::<f64>().ok()?;
            cell.as_f64()?.partial_cmp(&v)
        }
        CellValue::Text(s) => match (s.trim().parse::<f64>(), value.trim().parse::<f64>()) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b),
            _ => Some(s.to_lowercase().as_str().cmp(value.to_lowercase().as_str())),
        },
        CellValue::Bool(_) | CellValue::Null => None,
    }
}

/// Parses a filter value for timestamp comparisons.
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> IndexMap<String, FilterField> {
        let mut map = IndexMap::new();
        map.insert(
            "region".to_string(),
            FilterField {
                column: Some("region".into()),
                ..Default::default()
            },
        );
        map.insert(
            "name".to_string(),
            FilterField {
                column: Some("productName".into()),
                matching: FieldMatch::Contains,
                ..Default::default()
            },
        );
        map.insert(
            "qty".to_string(),
            FilterField {
                column: Some("stockCount".into()),
                ..Default::default()
            },
        );
        map
    }

    fn rows() -> RowSet {
        RowSet {
            columns: vec!["region".into(), "productName".into(), "stockCount".into()],
            rows: vec![
                vec!["EMEA".into(), "Blue Widget".into(), CellValue::Integer(10)],
                vec!["emea".into(), "Red Gadget".into(), CellValue::Integer(3)],
                vec!["APAC".into(), "Blue Gadget".into(), CellValue::Null],
            ],
            refreshed_at: None,
        }
    }

    fn apply(filters: FilterSet) -> RowSet {
        let predicates = filters
            .resolve("inventory", &fields(), UnknownFilterPolicy::Reject)
            .unwrap();
        InMemoryEvaluator.apply(rows(), &predicates)
    }

    #[test]
    fn test_split_suffix() {
        assert_eq!(FilterOp::split_suffix("qty_gte"), Some(("qty", FilterOp::Gte)));
        assert_eq!(FilterOp::split_suffix("qty_gt"), Some(("qty", FilterOp::Gt)));
        assert_eq!(
            FilterOp::split_suffix("date_start"),
            Some(("date", FilterOp::Gte))
        );
        assert_eq!(FilterOp::split_suffix("region"), None);
        assert_eq!(FilterOp::split_suffix("_in"), None);
    }

    #[test]
    fn test_equality_is_case_insensitive() {
        let result = apply(FilterSet::new().with("region", "Emea"));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_declared_contains_match() {
        let result = apply(FilterSet::new().with("name", "gadget"));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_filters_are_and_combined() {
        let result = apply(FilterSet::new().with("region", "emea").with("name", "blue"));
        assert_eq!(result.len(), 1);
        assert_eq!(result.rows[0][1], CellValue::from("Blue Widget"));
    }

    #[test]
    fn test_numeric_range_skips_nulls() {
        let result = apply(FilterSet::new().with("qty_gte", "3").with("qty_lt", "10"));
        assert_eq!(result.len(), 1);
        let result = apply(FilterSet::new().with("qty_ne", "10"));
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_in_operator() {
        let result = apply(FilterSet::new().with("region_in", "apac, EMEA"));
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_empty_values_are_dropped() {
        let set = FilterSet::new().with("region", "  ");
        assert!(set.is_empty());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = FilterSet::new()
            .with("colour", "red")
            .resolve("inventory", &fields(), UnknownFilterPolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, HeraldError::FilterKeyUnknown { ref key, .. } if key == "colour"));
    }

    #[test]
    fn test_unknown_key_matches_nothing() {
        let predicates = FilterSet::new()
            .with("colour", "red")
            .resolve("inventory", &fields(), UnknownFilterPolicy::MatchNothing)
            .unwrap();
        assert!(predicates.matches_nothing());
        assert!(InMemoryEvaluator.apply(rows(), &predicates).is_empty());
        assert!(PushedDownEvaluator.apply(rows(), &predicates).is_empty());
    }

    #[test]
    fn test_missing_column_matches_nothing() {
        let mut fields = fields();
        fields.insert(
            "warehouse".into(),
            FilterField {
                column: Some("warehouseCode".into()),
                ..Default::default()
            },
        );
        let predicates = FilterSet::new()
            .with("warehouse", "W1")
            .resolve("inventory", &fields, UnknownFilterPolicy::Reject)
            .unwrap();
        assert!(InMemoryEvaluator.apply(rows(), &predicates).is_empty());
    }

    #[test]
    fn test_source_column_names_resolve_to_canonical() {
        let mut fields = IndexMap::new();
        fields.insert(
            "count".to_string(),
            FilterField {
                column: Some("stock_count".into()),
                ..Default::default()
            },
        );
        let predicates = FilterSet::new()
            .with("count", "3")
            .resolve("inventory", &fields, UnknownFilterPolicy::Reject)
            .unwrap();
        assert_eq!(InMemoryEvaluator.apply(rows(), &predicates).len(), 1);
    }

    #[test]
    fn test_timestamp_comparison() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let p = Predicate {
            key: "day".into(),
            column: None,
            report_filter: None,
            op: FilterOp::Lte,
            value: "2024-03-01".into(),
        };
        assert!(p.matches(&CellValue::Timestamp(ts)));
        assert!(!p.matches(&CellValue::Null));
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        let p = Predicate {
            key: "qty".into(),
            column: None,
            report_filter: None,
            op: FilterOp::Eq,
            value: "10.0".into(),
        };
        assert!(p.matches(&CellValue::Integer(10)));
    }
}
