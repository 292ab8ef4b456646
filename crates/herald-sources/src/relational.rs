//! Relational source adapter.
//!
//! Both relational sources share this adapter; they differ in SQL dialect and
//! in the [`QueryExecutor`] that talks to the database.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument};

use herald_config::{SourceDescriptor, SourceKind};
use herald_core::{HeraldError, Normalizer, RawTable};

pub use crate::sql::{ColumnKind, ColumnMeta};
use crate::sql::{BuiltQuery, SqlDialect};
use crate::{FetchOutcome, FetchRequest, SourceAdapter};

/// Database access used by [`RelationalAdapter`].
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Columns of `schema.table` in ordinal order. Empty when the table does not exist.
    async fn columns(&self, query: &BuiltQuery) -> Result<Vec<ColumnMeta>, HeraldError>;

    /// Runs a SELECT whose projection is `columns`.
    async fn query(&self, query: &BuiltQuery, columns: &[ColumnMeta])
    -> Result<RawTable, HeraldError>;
}

/// Adapter for relational-A and relational-B endpoints.
pub struct RelationalAdapter {
    kind: SourceKind,
    dialect: SqlDialect,
    executor: Arc<dyn QueryExecutor>,
    timeout: Duration,
    normalizer: Normalizer,
}

impl RelationalAdapter {
    pub fn new(
        kind: SourceKind,
        dialect: SqlDialect,
        executor: Arc<dyn QueryExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            kind,
            dialect,
            executor,
            timeout,
            normalizer: Normalizer::default(),
        }
    }

    /// Normalizer whose identifier rules pushed-down filters follow.
    #[must_use]
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// PostgreSQL-backed relational-B adapter.
    pub fn postgres(executor: Arc<dyn QueryExecutor>, timeout: Duration) -> Self {
        Self::new(SourceKind::RelationalB, SqlDialect::Postgres, executor, timeout)
    }

    /// SQL Server relational-A adapter over a caller-supplied executor.
    pub fn mssql(executor: Arc<dyn QueryExecutor>, timeout: Duration) -> Self {
        Self::new(SourceKind::RelationalA, SqlDialect::Mssql, executor, timeout)
    }
}

#[async_trait]
impl SourceAdapter for RelationalAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(
        skip(self, request),
        fields(endpoint = %request.endpoint.name, full = request.want_full)
    )]
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, HeraldError> {
        let source_id = self.kind.as_str();
        let SourceDescriptor::Relational { schema, table } = &request.endpoint.descriptor else {
            return Err(HeraldError::source_query(
                source_id,
                format!("endpoint '{}' has no relational descriptor", request.endpoint.name),
            ));
        };

        let started = Instant::now();
        let columns = self
            .executor
            .columns(&self.dialect.columns_query(schema, table))
            .await?;
        if columns.is_empty() {
            return Err(HeraldError::source_query(
                source_id,
                format!("table {schema}.{table} not found or has no columns"),
            ));
        }

        let predicates = if request.want_full {
            &[][..]
        } else {
            &request.predicates.predicates[..]
        };
        let query = self
            .dialect
            .select(schema, table, &columns, predicates, &self.normalizer)
            .map_err(|e| HeraldError::source_query(source_id, e.to_string()))?;
        debug!(sql = %query, params = query.params.len(), "Running relational query");

        let table = self.executor.query(&query, &columns).await?;
        Ok(FetchOutcome {
            table,
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use herald_config::EndpointCatalog;
    use herald_core::{CellValue, FilterSet, NormalizerOptions, UnknownFilterPolicy};
    use std::sync::Mutex;

    /// Executor that records queries and serves a fixed table.
    #[derive(Default)]
    pub(crate) struct RecordingExecutor {
        pub columns: Vec<ColumnMeta>,
        pub rows: Vec<Vec<CellValue>>,
        pub queries: Mutex<Vec<BuiltQuery>>,
    }

    #[async_trait]
    impl QueryExecutor for RecordingExecutor {
        async fn columns(&self, _query: &BuiltQuery) -> Result<Vec<ColumnMeta>, HeraldError> {
            Ok(self.columns.clone())
        }

        async fn query(
            &self,
            query: &BuiltQuery,
            columns: &[ColumnMeta],
        ) -> Result<RawTable, HeraldError> {
            self.queries.lock().unwrap().push(query.clone());
            Ok(RawTable::new(
                columns.iter().map(|c| c.name.clone()).collect(),
                self.rows.clone(),
            ))
        }
    }

    fn endpoint() -> Arc<herald_config::EndpointConfig> {
        let catalog = EndpointCatalog::from_toml_str(
            r#"
[endpoints.inventory]
behavior = "cachepg"
[endpoints.inventory.relational]
schema = "stock"
table = "inventory"
[endpoints.inventory.filters.region]
column = "region"
[endpoints.inventory.filters.warehouse]
column = "warehouse_code"
[endpoints.inventory.filters.agency]
column = "agency_code"
"#,
        )
        .unwrap();
        catalog.get("inventory").unwrap().clone()
    }

    fn executor() -> Arc<RecordingExecutor> {
        Arc::new(RecordingExecutor {
            columns: vec![
                ColumnMeta::new("region", "text"),
                ColumnMeta::new("qty", "integer"),
            ],
            rows: vec![vec!["EMEA".into(), CellValue::Integer(1)]],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_filters_are_pushed_down() {
        let exec = executor();
        let adapter = RelationalAdapter::postgres(exec.clone(), Duration::from_secs(5));
        let endpoint = endpoint();
        let predicates = FilterSet::new()
            .with("region", "emea")
            .resolve("inventory", &endpoint.filters, UnknownFilterPolicy::Reject)
            .unwrap();

        let outcome = adapter
            .fetch(&FetchRequest::filtered(endpoint, "summary", predicates))
            .await
            .unwrap();
        assert_eq!(outcome.table.len(), 1);

        let queries = exec.queries.lock().unwrap();
        assert!(queries[0].sql.contains("FROM \"stock\".\"inventory\" WHERE"));
        assert_eq!(queries[0].params, vec!["emea"]);
    }

    #[tokio::test]
    async fn test_agency_filter_uses_padded_identifier() {
        let exec = Arc::new(RecordingExecutor {
            columns: vec![
                ColumnMeta::new("agency_code", "integer"),
                ColumnMeta::new("qty", "integer"),
            ],
            rows: vec![vec![CellValue::Integer(42), CellValue::Integer(1)]],
            ..Default::default()
        });
        let adapter = RelationalAdapter::postgres(exec.clone(), Duration::from_secs(5))
            .with_normalizer(Normalizer::new(NormalizerOptions {
                identifier_width: Some(5),
                ..Default::default()
            }));
        let endpoint = endpoint();
        let predicates = FilterSet::new()
            .with("agency", "00042")
            .resolve("inventory", &endpoint.filters, UnknownFilterPolicy::Reject)
            .unwrap();

        adapter
            .fetch(&FetchRequest::filtered(endpoint, "summary", predicates))
            .await
            .unwrap();
        let queries = exec.queries.lock().unwrap();
        assert!(queries[0].sql.contains("LPAD(TRIM(CAST(\"agency_code\" AS text)), 5, '0')"));
        assert_eq!(queries[0].params, vec!["00042"]);
    }

    #[tokio::test]
    async fn test_full_fetch_ignores_filters() {
        let exec = executor();
        let adapter = RelationalAdapter::postgres(exec.clone(), Duration::from_secs(5));
        let endpoint = endpoint();
        let predicates = FilterSet::new()
            .with("region", "emea")
            .resolve("inventory", &endpoint.filters, UnknownFilterPolicy::Reject)
            .unwrap();
        let mut request = FetchRequest::filtered(endpoint, "summary", predicates);
        request.want_full = true;

        adapter.fetch(&request).await.unwrap();
        let queries = exec.queries.lock().unwrap();
        assert!(!queries[0].sql.contains("WHERE"));
        assert!(queries[0].params.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_mapped_column_is_query_error() {
        let exec = executor();
        let adapter = RelationalAdapter::postgres(exec, Duration::from_secs(5));
        let endpoint = endpoint();
        let predicates = FilterSet::new()
            .with("warehouse", "W1")
            .resolve("inventory", &endpoint.filters, UnknownFilterPolicy::Reject)
            .unwrap();

        let err = adapter
            .fetch(&FetchRequest::filtered(endpoint, "summary", predicates))
            .await
            .unwrap_err();
        assert!(matches!(err, HeraldError::SourceQueryError { .. }));
    }

    #[tokio::test]
    async fn test_missing_table() {
        let exec = Arc::new(RecordingExecutor::default());
        let adapter = RelationalAdapter::postgres(exec, Duration::from_secs(5));
        let err = adapter
            .fetch(&FetchRequest::full(endpoint(), "summary"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stock.inventory"));
    }
}
