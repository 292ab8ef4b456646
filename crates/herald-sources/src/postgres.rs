//! PostgreSQL executor for the relational-B source.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx_core::pool::PoolOptions;
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, PgRow, Postgres};
use tracing::{debug, info, instrument};

use herald_core::{CellValue, HeraldError, RawTable};

use crate::relational::QueryExecutor;
use crate::sql::{BuiltQuery, ColumnKind, ColumnMeta};

const SOURCE_ID: &str = "relational-b";

/// Connection settings for the PostgreSQL source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSourceConfig {
    pub url: String,
    pub pool_size: u32,
    pub connect_timeout_ms: u64,
    /// Per-query timeout of the adapter.
    pub query_timeout_ms: u64,
}

impl Default for PostgresSourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: 10,
            connect_timeout_ms: 5_000,
            query_timeout_ms: 60_000,
        }
    }
}

impl PostgresSourceConfig {
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// [`QueryExecutor`] over a sqlx PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a lazily connecting pool; the first query opens the connection.
    #[instrument(skip(config), fields(url = %mask_password(&config.url)))]
    pub fn connect_lazy(config: &PostgresSourceConfig) -> Result<Self, HeraldError> {
        info!(pool_size = config.pool_size, "Creating PostgreSQL source pool");
        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
            .test_before_acquire(false)
            .connect_lazy(&config.url)
            .map_err(map_sqlx_error)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn columns(&self, query: &BuiltQuery) -> Result<Vec<ColumnMeta>, HeraldError> {
        let mut q = sqlx_core::query::query::<Postgres>(&query.sql);
        for param in &query.params {
            q = q.bind(param.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| {
                let name: String = row.try_get(0).map_err(map_sqlx_error)?;
                let data_type: String = row.try_get(1).map_err(map_sqlx_error)?;
                Ok(ColumnMeta::new(name, data_type))
            })
            .collect()
    }

    async fn query(
        &self,
        query: &BuiltQuery,
        columns: &[ColumnMeta],
    ) -> Result<RawTable, HeraldError> {
        let mut q = sqlx_core::query::query::<Postgres>(&query.sql);
        for param in &query.params {
            q = q.bind(param.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        debug!(rows = rows.len(), "PostgreSQL query returned");

        let data = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| extract_cell(row, i, column))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RawTable::new(
            columns.iter().map(|c| c.name.clone()).collect(),
            data,
        ))
    }
}

/// Reads one cell; the projection already cast it to the type the column kind expects.
fn extract_cell(
    row: &PgRow,
    index: usize,
    column: &ColumnMeta,
) -> Result<CellValue, HeraldError> {
    let name = column.name.as_str();
    match column.kind() {
        ColumnKind::Integer => decoded(name, row.try_get(index), CellValue::Integer),
        ColumnKind::Float => decoded(name, row.try_get(index), CellValue::Float),
        ColumnKind::Bool => decoded(name, row.try_get(index), CellValue::Bool),
        ColumnKind::Timestamp => {
            decoded(name, row.try_get::<Option<NaiveDateTime>, _>(index), CellValue::Timestamp)
        }
        ColumnKind::Text => decoded(name, row.try_get(index), CellValue::Text),
    }
}

/// SQL NULL becomes [`CellValue::Null`]; a value that fails to decode is a query error.
fn decoded<T>(
    column: &str,
    value: Result<Option<T>, sqlx_core::error::Error>,
    wrap: fn(T) -> CellValue,
) -> Result<CellValue, HeraldError> {
    match value {
        Ok(Some(v)) => Ok(wrap(v)),
        Ok(None) => Ok(CellValue::Null),
        Err(e) => Err(HeraldError::source_query(
            SOURCE_ID,
            format!("failed to decode column '{column}': {e}"),
        )),
    }
}

fn map_sqlx_error(err: sqlx_core::error::Error) -> HeraldError {
    use sqlx_core::error::Error;
    match err {
        Error::Database(db) => HeraldError::source_query(SOURCE_ID, db.to_string()),
        Error::ColumnDecode { .. }
        | Error::ColumnNotFound(_)
        | Error::ColumnIndexOutOfBounds { .. } => {
            HeraldError::source_query(SOURCE_ID, err.to_string())
        }
        Error::PoolTimedOut => {
            HeraldError::source_unavailable(SOURCE_ID, "timed out acquiring a connection")
        }
        other => HeraldError::source_unavailable(SOURCE_ID, other.to_string()),
    }
}

/// Masks the password in a database URL for logging.
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@')
        && let Some(colon_pos) = url[..at_pos].rfind(':')
    {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        if colon_pos > scheme_end {
            return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("postgres://report:secret@db/warehouse"),
            "postgres://report:****@db/warehouse"
        );
        assert_eq!(
            mask_password("postgres://db/warehouse"),
            "postgres://db/warehouse"
        );
    }

    #[test]
    fn test_pool_errors_map_to_backend_errors() {
        assert!(matches!(
            map_sqlx_error(sqlx_core::error::Error::PoolTimedOut),
            HeraldError::SourceUnavailable { .. }
        ));
        assert!(matches!(
            map_sqlx_error(sqlx_core::error::Error::PoolClosed),
            HeraldError::SourceUnavailable { .. }
        ));
    }

    #[test]
    fn test_cell_decoding() {
        let cell = decoded("qty", Ok(Some(7_i64)), CellValue::Integer).unwrap();
        assert_eq!(cell, CellValue::Integer(7));
        let cell = decoded::<i64>("qty", Ok(None), CellValue::Integer).unwrap();
        assert_eq!(cell, CellValue::Null);

        let overflow = sqlx_core::error::Error::ColumnDecode {
            index: "\"qty\"".into(),
            source: "value out of range for i64".into(),
        };
        let err = decoded::<i64>("qty", Err(overflow), CellValue::Integer).unwrap_err();
        assert!(matches!(err, HeraldError::SourceQueryError { .. }));
        assert!(err.to_string().contains("qty"));
    }

    #[test]
    fn test_unconfigured_by_default() {
        assert!(!PostgresSourceConfig::default().is_configured());
    }
}
