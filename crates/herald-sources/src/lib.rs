//! # herald-sources
//!
//! Source adapters turn an endpoint descriptor plus resolved filters into a
//! [`RawTable`]. Relational sources translate filters into a parameterized
//! `WHERE` clause; the report source translates them into the report API's
//! view filter. With `want_full` set, filters are ignored and the whole
//! dataset comes back, which is what the full-dataset cache stores.
//!
//! Adapters do no caching and no retries.

pub mod postgres;
pub mod relational;
pub mod report;
pub mod sql;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use herald_config::{EndpointConfig, SourceKind};
use herald_core::{HeraldError, PredicateSet, RawTable};

pub use postgres::{PgExecutor, PostgresSourceConfig};
pub use relational::{ColumnKind, ColumnMeta, QueryExecutor, RelationalAdapter};
pub use report::{
    ExportRequest, HttpReportClient, ReportAdapter, ReportClient, ReportClientConfig,
    ReportDescription,
};
pub use sql::{BuiltQuery, SqlDialect};

/// One fetch against a backend.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub endpoint: Arc<EndpointConfig>,
    pub info_type: String,
    pub predicates: PredicateSet,
    /// Ignore filters and return the entire dataset.
    pub want_full: bool,
}

impl FetchRequest {
    /// Request for the whole unfiltered dataset.
    #[must_use]
    pub fn full(endpoint: Arc<EndpointConfig>, info_type: impl Into<String>) -> Self {
        Self {
            endpoint,
            info_type: info_type.into(),
            predicates: PredicateSet::default(),
            want_full: true,
        }
    }

    /// Request with filters pushed down to the backend.
    #[must_use]
    pub fn filtered(
        endpoint: Arc<EndpointConfig>,
        info_type: impl Into<String>,
        predicates: PredicateSet,
    ) -> Self {
        Self {
            endpoint,
            info_type: info_type.into(),
            predicates,
            want_full: false,
        }
    }
}

/// Rows returned by a backend and how long the fetch took.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub table: RawTable,
    pub duration: Duration,
}

/// A data source serving one [`SourceKind`].
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// The adapter's own timeout. Callers wrap fetches in a timeout at least this long.
    fn timeout(&self) -> Duration;

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, HeraldError>;
}

/// Placeholder for a source with no connection configured.
#[derive(Debug, Clone, Copy)]
pub struct UnconfiguredSource(pub SourceKind);

#[async_trait]
impl SourceAdapter for UnconfiguredSource {
    fn kind(&self) -> SourceKind {
        self.0
    }

    fn timeout(&self) -> Duration {
        Duration::ZERO
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<FetchOutcome, HeraldError> {
        Err(HeraldError::source_unavailable(
            self.0.as_str(),
            "no connection configured for this source",
        ))
    }
}

/// Adapters by source kind.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Adapter for `kind`; an [`UnconfiguredSource`] when none is registered.
    #[must_use]
    pub fn get(&self, kind: SourceKind) -> Arc<dyn SourceAdapter> {
        self.adapters
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(UnconfiguredSource(kind)))
    }

    /// Longest timeout across registered adapters.
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        self.adapters
            .values()
            .map(|a| a.timeout())
            .max()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().map(SourceKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("SourceRegistry").field("adapters", &kinds).finish()
    }
}
