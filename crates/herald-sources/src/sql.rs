//! Parameterized SELECT generation for the relational sources.
//!
//! Identifiers are validated and quoted per dialect; every filter value is a
//! bound parameter. Conditions mirror the in-memory evaluator: text compares
//! case-insensitively, numeric columns compare by value, and identifier
//! columns compare on the trimmed, zero-padded text the normalizer produces.

use std::fmt;

use herald_core::filter::parse_timestamp;
use herald_core::{FilterOp, Normalizer, Predicate};

/// SQL flavor of a relational source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// PostgreSQL: `"ident"`, `$n` placeholders.
    Postgres,
    /// SQL Server: `[ident]`, `?` placeholders.
    Mssql,
}

/// Value family of a column, derived from its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Bool,
    Timestamp,
    Text,
}

impl ColumnKind {
    /// Classifies an `information_schema.columns.data_type` value.
    #[must_use]
    pub fn from_data_type(data_type: &str) -> Self {
        let dt = data_type.trim().to_ascii_lowercase();
        match dt.as_str() {
            "smallint" | "integer" | "int" | "bigint" | "tinyint" | "int2" | "int4" | "int8"
            | "serial" | "bigserial" => Self::Integer,
            "numeric" | "decimal" | "real" | "double precision" | "float" | "float4"
            | "float8" | "money" | "smallmoney" => Self::Float,
            "boolean" | "bool" | "bit" => Self::Bool,
            "date" | "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" => {
                Self::Timestamp
            }
            other if other.starts_with("timestamp") => Self::Timestamp,
            _ => Self::Text,
        }
    }
}

/// A column reported by the source's `information_schema`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ColumnKind {
        ColumnKind::from_data_type(&self.data_type)
    }
}

/// SQL text plus its positional text parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<String>,
}

impl fmt::Display for BuiltQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

/// Errors raised while building a query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SqlBuildError {
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("column '{0}' does not exist")]
    UnknownColumn(String),
}

impl SqlDialect {
    /// Quotes a validated identifier.
    pub fn quote(&self, ident: &str) -> Result<String, SqlBuildError> {
        if !herald_config::endpoint::valid_identifier(ident) {
            return Err(SqlBuildError::InvalidIdentifier(ident.to_string()));
        }
        Ok(match self {
            Self::Postgres => format!("\"{ident}\""),
            Self::Mssql => format!("[{ident}]"),
        })
    }

    fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            Self::Mssql => "?".to_string(),
        }
    }

    fn as_text(&self, quoted: &str) -> String {
        match self {
            Self::Postgres => format!("CAST({quoted} AS text)"),
            Self::Mssql => format!("CAST({quoted} AS NVARCHAR(MAX))"),
        }
    }

    fn cast_param(&self, placeholder: &str, kind: ColumnKind) -> String {
        match (self, kind) {
            (Self::Postgres, ColumnKind::Integer | ColumnKind::Float) => {
                format!("CAST({placeholder} AS numeric)")
            }
            (Self::Postgres, ColumnKind::Timestamp) => format!("CAST({placeholder} AS timestamp)"),
            (Self::Mssql, ColumnKind::Integer | ColumnKind::Float) => {
                format!("CAST({placeholder} AS FLOAT)")
            }
            (Self::Mssql, ColumnKind::Timestamp) => format!("CAST({placeholder} AS DATETIME2)"),
            _ => format!("LOWER({placeholder})"),
        }
    }

    /// Text of an identifier column as [`Normalizer`] renders it: integral
    /// floats lose their fraction, values are trimmed and all-digit values
    /// shorter than `width` are left-padded with zeros.
    fn identifier_text(&self, quoted: &str, kind: ColumnKind, width: Option<usize>) -> String {
        let text = match kind {
            ColumnKind::Float => {
                let int = match self {
                    Self::Postgres => "int8",
                    Self::Mssql => "BIGINT",
                };
                format!(
                    "CASE WHEN {quoted} = FLOOR({quoted}) AND ABS({quoted}) < 1e15 \
                     THEN {} ELSE {} END",
                    self.as_text(&format!("CAST({quoted} AS {int})")),
                    self.as_text(quoted)
                )
            }
            _ => self.as_text(quoted),
        };
        let t = match self {
            Self::Postgres => format!("TRIM({text})"),
            Self::Mssql => format!("LTRIM(RTRIM({text}))"),
        };
        let Some(width) = width else {
            return t;
        };
        match self {
            Self::Postgres => format!(
                "CASE WHEN {t} ~ '^[0-9]+$' AND LENGTH({t}) < {width} \
                 THEN LPAD({t}, {width}, '0') ELSE {t} END"
            ),
            Self::Mssql => format!(
                "CASE WHEN {t} <> '' AND {t} NOT LIKE '%[^0-9]%' AND LEN({t}) < {width} \
                 THEN RIGHT(REPLICATE('0', {width}) + {t}, {width}) ELSE {t} END"
            ),
        }
    }

    /// Projection of one column. PostgreSQL casts to the type the row decoder expects.
    fn projection(&self, column: &ColumnMeta) -> Result<String, SqlBuildError> {
        let quoted = self.quote(&column.name)?;
        Ok(match self {
            Self::Postgres => {
                let cast = match column.kind() {
                    ColumnKind::Integer => "int8",
                    ColumnKind::Float => "float8",
                    ColumnKind::Bool => "bool",
                    ColumnKind::Timestamp => "timestamp",
                    ColumnKind::Text => "text",
                };
                format!("{quoted}::{cast} AS {quoted}")
            }
            Self::Mssql => quoted,
        })
    }

    /// `information_schema` lookup returning `(column_name, data_type)` rows.
    #[must_use]
    pub fn columns_query(&self, schema: &str, table: &str) -> BuiltQuery {
        let sql = format!(
            "SELECT {}, {} FROM information_schema.columns \
             WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
            self.as_text("column_name"),
            self.as_text("data_type"),
            self.placeholder(1),
            self.placeholder(2)
        );
        BuiltQuery {
            sql,
            params: vec![schema.to_string(), table.to_string()],
        }
    }

    /// Builds `SELECT <columns> FROM schema.table [WHERE ...] ORDER BY 1`.
    ///
    /// Predicate columns must be present in `columns`; they are matched
    /// case-insensitively and the source's spelling is used. `normalizer`
    /// decides which columns compare as identifiers.
    pub fn select(
        &self,
        schema: &str,
        table: &str,
        columns: &[ColumnMeta],
        predicates: &[Predicate],
        normalizer: &Normalizer,
    ) -> Result<BuiltQuery, SqlBuildError> {
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| self.projection(c))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ")
        };

        let mut sql = format!(
            "SELECT {projection} FROM {}.{}",
            self.quote(schema)?,
            self.quote(table)?
        );
        let mut params = Vec::new();
        let mut conditions = Vec::with_capacity(predicates.len());

        for predicate in predicates {
            let target = predicate.target_column();
            let column = columns
                .iter()
                .find(|c| c.name == target)
                .or_else(|| columns.iter().find(|c| c.name.eq_ignore_ascii_case(target)))
                .ok_or_else(|| SqlBuildError::UnknownColumn(target.to_string()))?;
            conditions.push(self.condition(column, predicate, normalizer, &mut params)?);
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY 1");

        Ok(BuiltQuery { sql, params })
    }

    fn condition(
        &self,
        column: &ColumnMeta,
        predicate: &Predicate,
        normalizer: &Normalizer,
        params: &mut Vec<String>,
    ) -> Result<String, SqlBuildError> {
        let quoted = self.quote(&column.name)?;
        let kind = column.kind();
        let identifier = normalizer.is_identifier_column(&column.name);
        let lowered = if identifier {
            let text = self.identifier_text(&quoted, kind, normalizer.identifier_width());
            format!("LOWER({text})")
        } else {
            format!("LOWER({})", self.as_text(&quoted))
        };
        let numeric = !identifier && matches!(kind, ColumnKind::Integer | ColumnKind::Float);
        let mut bind = |value: &str| {
            params.push(value.to_string());
            self.placeholder(params.len())
        };

        let condition = match predicate.op {
            FilterOp::Contains => {
                let pattern = format!("%{}%", escape_like(&predicate.value));
                format!("{lowered} LIKE LOWER({}) ESCAPE '\\'", bind(&pattern))
            }
            // Non-numeric values never equal a number.
            FilterOp::Eq | FilterOp::Ne | FilterOp::In if numeric => {
                let values: Vec<&str> = predicate
                    .values()
                    .into_iter()
                    .map(str::trim)
                    .filter(|v| is_number(v))
                    .collect();
                match (predicate.op, values.as_slice()) {
                    (FilterOp::Ne, []) => format!("{quoted} IS NOT NULL"),
                    (_, []) => "1 = 0".to_string(),
                    (FilterOp::Eq, [value]) => {
                        format!("{quoted} = {}", self.cast_param(&bind(*value), kind))
                    }
                    (FilterOp::Ne, [value]) => {
                        format!("{quoted} <> {}", self.cast_param(&bind(*value), kind))
                    }
                    (_, values) => {
                        let list = values
                            .iter()
                            .map(|v| self.cast_param(&bind(*v), kind))
                            .collect::<Vec<_>>()
                            .join(", ");
                        format!("{quoted} IN ({list})")
                    }
                }
            }
            FilterOp::Eq => format!("{lowered} = LOWER({})", bind(&predicate.value)),
            FilterOp::Ne => format!("{lowered} <> LOWER({})", bind(&predicate.value)),
            FilterOp::In => {
                let values = predicate.values();
                if values.is_empty() {
                    "1 = 0".to_string()
                } else {
                    let list = values
                        .into_iter()
                        .map(|v| format!("LOWER({})", bind(v)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{lowered} IN ({list})")
                }
            }
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                let op = match predicate.op {
                    FilterOp::Gt => ">",
                    FilterOp::Gte => ">=",
                    FilterOp::Lt => "<",
                    _ => "<=",
                };
                let value = predicate.value.trim();
                match kind {
                    _ if identifier => format!("{lowered} {op} LOWER({})", bind(&predicate.value)),
                    ColumnKind::Integer | ColumnKind::Float if is_number(value) => {
                        format!("{quoted} {op} {}", self.cast_param(&bind(value), kind))
                    }
                    ColumnKind::Timestamp => match parse_timestamp(value) {
                        Some(ts) => {
                            let ts = ts.format("%Y-%m-%d %H:%M:%S").to_string();
                            format!("{quoted} {op} {}", self.cast_param(&bind(&ts), kind))
                        }
                        None => "1 = 0".to_string(),
                    },
                    ColumnKind::Text => {
                        format!("{lowered} {op} LOWER({})", bind(&predicate.value))
                    }
                    ColumnKind::Integer | ColumnKind::Float | ColumnKind::Bool => {
                        "1 = 0".to_string()
                    }
                }
            }
        };
        Ok(condition)
    }
}

fn is_number(value: &str) -> bool {
    value.parse::<f64>().is_ok_and(f64::is_finite)
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use herald_core::{
        CellValue, FilterEvaluator, InMemoryEvaluator, NormalizerOptions, PredicateSet, RawTable,
        RowSet,
    };

    use super::*;

    fn columns() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta::new("region", "character varying"),
            ColumnMeta::new("stock_count", "integer"),
            ColumnMeta::new("updated_at", "timestamp without time zone"),
        ]
    }

    fn predicate(column: &str, op: FilterOp, value: &str) -> Predicate {
        Predicate {
            key: column.to_string(),
            column: Some(column.to_string()),
            report_filter: None,
            op,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_column_kind() {
        assert_eq!(ColumnKind::from_data_type("bigint"), ColumnKind::Integer);
        assert_eq!(
            ColumnKind::from_data_type("timestamp with time zone"),
            ColumnKind::Timestamp
        );
        assert_eq!(ColumnKind::from_data_type("nvarchar"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_data_type("NUMERIC"), ColumnKind::Float);
    }

    #[test]
    fn test_postgres_full_select() {
        let q = SqlDialect::Postgres
            .select("public", "inventory", &columns(), &[], &Normalizer::default())
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"region\"::text AS \"region\", \"stock_count\"::int8 AS \"stock_count\", \
             \"updated_at\"::timestamp AS \"updated_at\" FROM \"public\".\"inventory\" ORDER BY 1"
        );
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_postgres_conditions() {
        let q = SqlDialect::Postgres
            .select(
                "public",
                "inventory",
                &columns(),
                &[
                    predicate("REGION", FilterOp::Eq, "EMEA"),
                    predicate("stock_count", FilterOp::Gte, "10"),
                    predicate("region", FilterOp::Contains, "50%"),
                ],
                &Normalizer::default(),
            )
            .unwrap();
        assert!(q.sql.contains(
            "WHERE LOWER(CAST(\"region\" AS text)) = LOWER($1) \
             AND \"stock_count\" >= CAST($2 AS numeric) \
             AND LOWER(CAST(\"region\" AS text)) LIKE LOWER($3) ESCAPE '\\'"
        ));
        assert_eq!(q.params, vec!["EMEA", "10", "%50\\%%"]);
    }

    #[test]
    fn test_mssql_in_list() {
        let q = SqlDialect::Mssql
            .select(
                "dbo",
                "sales",
                &columns(),
                &[predicate("region", FilterOp::In, "emea, apac")],
                &Normalizer::default(),
            )
            .unwrap();
        assert!(
            q.sql
                .starts_with("SELECT [region], [stock_count], [updated_at] FROM [dbo].[sales]")
        );
        assert!(q.sql.contains("LOWER(CAST([region] AS NVARCHAR(MAX))) IN (LOWER(?), LOWER(?))"));
        assert_eq!(q.params, vec!["emea", "apac"]);
    }

    fn agency_rows(normalizer: &Normalizer) -> RowSet {
        let raw = RawTable::new(
            vec!["acente".into(), "qty".into(), "region".into()],
            vec![
                vec![CellValue::Integer(42), CellValue::Integer(10), "EMEA".into()],
                vec![CellValue::Integer(7), CellValue::Integer(25), "apac".into()],
                vec![CellValue::Integer(12345), CellValue::Null, "emea".into()],
            ],
        );
        normalizer.normalize(raw).unwrap()
    }

    #[test]
    fn test_pushdown_selects_what_memory_filter_selects() {
        let normalizer = Normalizer::new(NormalizerOptions {
            identifier_width: Some(5),
            ..Default::default()
        });
        let meta = vec![
            ColumnMeta::new("acente", "integer"),
            ColumnMeta::new("qty", "integer"),
            ColumnMeta::new("region", "text"),
        ];
        let rows = agency_rows(&normalizer);
        let t = "TRIM(CAST(\"acente\" AS text))";
        let agency = format!(
            "LOWER(CASE WHEN {t} ~ '^[0-9]+$' AND LENGTH({t}) < 5 \
             THEN LPAD({t}, 5, '0') ELSE {t} END)"
        );

        let cases = vec![
            (
                predicate("acente", FilterOp::Eq, "00042"),
                vec!["00042"],
                format!("{agency} = LOWER($1)"),
                vec!["00042"],
            ),
            (
                predicate("acente", FilterOp::Eq, "42"),
                vec![],
                format!("{agency} = LOWER($1)"),
                vec!["42"],
            ),
            (
                predicate("acente", FilterOp::Ne, "00042"),
                vec!["00007", "12345"],
                format!("{agency} <> LOWER($1)"),
                vec!["00042"],
            ),
            (
                predicate("acente", FilterOp::In, "00007, 12345"),
                vec!["00007", "12345"],
                format!("{agency} IN (LOWER($1), LOWER($2))"),
                vec!["00007", "12345"],
            ),
            (
                predicate("qty", FilterOp::Eq, "10.0"),
                vec!["00042"],
                "\"qty\" = CAST($1 AS numeric)".to_string(),
                vec!["10.0"],
            ),
            (
                predicate("qty", FilterOp::Eq, "abc"),
                vec![],
                "1 = 0".to_string(),
                vec![],
            ),
            (
                predicate("qty", FilterOp::Ne, "abc"),
                vec!["00042", "00007"],
                "\"qty\" IS NOT NULL".to_string(),
                vec![],
            ),
            (
                predicate("qty", FilterOp::Ne, "10"),
                vec!["00007"],
                "\"qty\" <> CAST($1 AS numeric)".to_string(),
                vec!["10"],
            ),
            (
                predicate("qty", FilterOp::In, "10, x, 25.0"),
                vec!["00042", "00007"],
                "\"qty\" IN (CAST($1 AS numeric), CAST($2 AS numeric))".to_string(),
                vec!["10", "25.0"],
            ),
            (
                predicate("qty", FilterOp::Gte, "25"),
                vec!["00007"],
                "\"qty\" >= CAST($1 AS numeric)".to_string(),
                vec!["25"],
            ),
            (
                predicate("qty", FilterOp::Gt, "abc"),
                vec![],
                "1 = 0".to_string(),
                vec![],
            ),
            (
                predicate("region", FilterOp::Eq, "emea"),
                vec!["00042", "12345"],
                "LOWER(CAST(\"region\" AS text)) = LOWER($1)".to_string(),
                vec!["emea"],
            ),
            (
                predicate("region", FilterOp::Contains, "MEA"),
                vec!["00042", "12345"],
                "LOWER(CAST(\"region\" AS text)) LIKE LOWER($1) ESCAPE '\\'".to_string(),
                vec!["%MEA%"],
            ),
        ];

        for (p, expected_rows, expected_sql, expected_params) in cases {
            let label = format!("{} {} {}", p.key, p.op, p.value);
            let set = PredicateSet {
                predicates: vec![p.clone()],
                unknown: vec![],
            };
            let matched: Vec<String> = InMemoryEvaluator
                .apply(rows.clone(), &set)
                .rows
                .iter()
                .map(|r| r[0].to_string())
                .collect();
            assert_eq!(matched, expected_rows, "in-memory {label}");

            let q = SqlDialect::Postgres
                .select("public", "agencies", &meta, &[p], &normalizer)
                .unwrap();
            let condition = q
                .sql
                .split_once(" WHERE ")
                .and_then(|(_, w)| w.strip_suffix(" ORDER BY 1"))
                .unwrap();
            assert_eq!(condition, expected_sql, "pushdown {label}");
            assert_eq!(q.params, expected_params, "params {label}");
        }
    }

    #[test]
    fn test_mssql_identifier_float_column() {
        let normalizer = Normalizer::new(NormalizerOptions {
            identifier_width: Some(5),
            ..Default::default()
        });
        let q = SqlDialect::Mssql
            .select(
                "dbo",
                "agencies",
                &[ColumnMeta::new("agency_code", "float")],
                &[predicate("agency_code", FilterOp::Eq, "00042")],
                &normalizer,
            )
            .unwrap();
        assert!(q.sql.contains("CAST(CAST([agency_code] AS BIGINT) AS NVARCHAR(MAX))"));
        assert!(q.sql.contains("NOT LIKE '%[^0-9]%' AND LEN("));
        assert!(q.sql.contains("RIGHT(REPLICATE('0', 5) + LTRIM(RTRIM("));
        assert_eq!(q.params, vec!["00042"]);
    }

    #[test]
    fn test_timestamp_range_values() {
        let q = SqlDialect::Postgres
            .select(
                "public",
                "inventory",
                &columns(),
                &[
                    predicate("updated_at", FilterOp::Gte, "2024-03-01"),
                    predicate("updated_at", FilterOp::Lt, "yesterday"),
                ],
                &Normalizer::default(),
            )
            .unwrap();
        assert!(q.sql.contains(
            "WHERE \"updated_at\" >= CAST($1 AS timestamp) AND 1 = 0 ORDER BY 1"
        ));
        assert_eq!(q.params, vec!["2024-03-01 00:00:00"]);
    }

    #[test]
    fn test_unknown_column_rejected() {
        let err = SqlDialect::Postgres
            .select(
                "public",
                "inventory",
                &columns(),
                &[predicate("colour", FilterOp::Eq, "red")],
                &Normalizer::default(),
            )
            .unwrap_err();
        assert_eq!(err, SqlBuildError::UnknownColumn("colour".into()));
    }

    #[test]
    fn test_identifier_injection_rejected() {
        assert!(SqlDialect::Postgres.quote("name\"; drop table x; --").is_err());
        assert!(SqlDialect::Mssql.quote("a]b").is_err());
    }

    #[test]
    fn test_columns_query() {
        let q = SqlDialect::Mssql.columns_query("dbo", "sales");
        assert!(q.sql.contains("table_schema = ? AND table_name = ?"));
        assert_eq!(q.params, vec!["dbo", "sales"]);
    }
}
