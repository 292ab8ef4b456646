//! Request orchestration.
//!
//! A report request is resolved against the endpoint catalog, then served
//! through one of two paths:
//!
//! - dataset path: the endpoint enables the full-dataset cache, so the
//!   complete unfiltered dataset is read from (or loaded into) the cache and
//!   filtered in memory;
//! - live path: filters are pushed down to the source and its result is
//!   already filtered.
//!
//! Both paths end in the same pagination and response shape. Every response
//! carries the proxy directive for the external reverse-proxy cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use herald_cache::{
    CacheMetadata, DatasetLoader, FullDatasetCache, LoadedDataset, ProxyCacheCoordinator,
    ProxyCacheDirective, PurgeReport, PurgeScope, RefreshReport,
};
use herald_config::endpoint::SUMMARY_INFO_TYPE;
use herald_config::{CacheTier, EndpointConfig, EndpointRegistry, SourceKind};
use herald_core::{
    FilterEvaluator, FilterSet, HeraldError, InMemoryEvaluator, Normalizer, PushedDownEvaluator,
    RowSet, UnknownFilterPolicy, paginate,
};
use herald_sources::{FetchOutcome, FetchRequest, SourceRegistry};

use crate::metrics;

/// One report request as received from a caller.
#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    pub endpoint: String,
    /// Defaults to `summary`.
    pub info_type: Option<String>,
    pub filters: FilterSet,
    /// 1-based, defaults to 1.
    pub page: Option<usize>,
    /// Defaults to the endpoint's page size.
    pub page_size: Option<usize>,
}

impl ReportRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key, value);
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn with_info_type(mut self, info_type: impl Into<String>) -> Self {
        self.info_type = Some(info_type.into());
        self
    }
}

/// One page of a report plus freshness and cache diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub endpoint: String,
    pub info_type: String,
    pub columns: Vec<String>,
    pub rows: Vec<IndexMap<String, Value>>,
    pub page: usize,
    pub page_size: usize,
    pub total_rows: usize,
    pub total_pages: usize,
    /// When the rows were fetched from the source.
    pub fetched_at: DateTime<Utc>,
    /// Refresh time reported by the source, if any.
    pub data_refreshed_at: Option<String>,
    pub source: String,
    pub fetch_duration_ms: u64,
    /// Rows came from a cached snapshot.
    pub is_cached: bool,
    /// `None` when the endpoint has no dataset cache.
    pub cache_hit: Option<bool>,
    pub cache_policy: String,
    #[serde(skip)]
    pub directive: ProxyCacheDirective,
}

/// Catalog entry as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSummary {
    pub name: String,
    pub behavior: String,
    pub description: Option<String>,
    pub info_types: Vec<String>,
    pub filters: Vec<String>,
    pub page_size: usize,
    pub full_dataset_cache: bool,
    pub cache_policy: String,
}

/// Rows produced by either serving path, before pagination.
struct Served {
    rows: RowSet,
    fetched_at: DateTime<Utc>,
    source: String,
    fetch_duration_ms: u64,
    is_cached: bool,
    cache_hit: Option<bool>,
}

/// Serves report requests across sources and cache tiers.
pub struct ReportService {
    registry: Arc<EndpointRegistry>,
    sources: SourceRegistry,
    proxy: Arc<ProxyCacheCoordinator>,
    dataset_cache: Option<Arc<FullDatasetCache>>,
    normalizer: Normalizer,
    request_timeout: Duration,
    unknown_keys: UnknownFilterPolicy,
    refresh_concurrency: usize,
}

impl ReportService {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        sources: SourceRegistry,
        proxy: Arc<ProxyCacheCoordinator>,
    ) -> Self {
        Self {
            registry,
            sources,
            proxy,
            dataset_cache: None,
            normalizer: Normalizer::default(),
            request_timeout: Duration::from_secs(330),
            unknown_keys: UnknownFilterPolicy::default(),
            refresh_concurrency: 4,
        }
    }

    #[must_use]
    pub fn with_dataset_cache(mut self, cache: Arc<FullDatasetCache>) -> Self {
        self.dataset_cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_unknown_filter_policy(mut self, policy: UnknownFilterPolicy) -> Self {
        self.unknown_keys = policy;
        self
    }

    #[must_use]
    pub fn with_refresh_concurrency(mut self, concurrency: usize) -> Self {
        self.refresh_concurrency = concurrency.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn dataset_cache(&self) -> Option<&Arc<FullDatasetCache>> {
        self.dataset_cache.as_ref()
    }

    pub fn proxy(&self) -> &Arc<ProxyCacheCoordinator> {
        &self.proxy
    }

    /// Serves one page of a report.
    #[instrument(skip(self, request), fields(endpoint = %request.endpoint))]
    pub async fn fetch_report(
        &self,
        request: &ReportRequest,
    ) -> Result<ReportResponse, HeraldError> {
        let started = Instant::now();
        let result = self.serve(request).await;
        metrics::record_report_request(
            &request.endpoint,
            result.as_ref().map(|r| r.is_cached),
            started.elapsed(),
        );
        match &result {
            Ok(response) => info!(
                info_type = %response.info_type,
                page = response.page,
                total_rows = response.total_rows,
                is_cached = response.is_cached,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Report served"
            ),
            Err(e) if e.is_client_error() => info!(error = %e, "Report request rejected"),
            Err(e) => warn!(error = %e, category = %e.category(), "Report request failed"),
        }
        result
    }

    async fn serve(&self, request: &ReportRequest) -> Result<ReportResponse, HeraldError> {
        let endpoint = self.registry.resolve(&request.endpoint)?;
        let info_type = request
            .info_type
            .clone()
            .unwrap_or_else(|| SUMMARY_INFO_TYPE.to_string());
        endpoint.check_info_type(&info_type)?;

        let page = request.page.unwrap_or(1);
        let page_size = request.page_size.unwrap_or(endpoint.page_size);
        if page == 0 || page_size == 0 {
            return Err(HeraldError::invalid_pagination(format!(
                "page and page_size must be >= 1 (got page={page}, page_size={page_size})"
            )));
        }

        let predicates = request
            .filters
            .resolve(&endpoint.name, &endpoint.filters, self.unknown_keys)?;
        let now = Utc::now();
        let directive = self.proxy.directive_for(
            &endpoint,
            self.proxy
                .request_key(&endpoint.name, &info_type, &request.filters, page, page_size),
            now,
        );

        let served = match self.dataset_cache.as_ref().filter(|_| endpoint.uses_dataset_cache()) {
            Some(cache) => {
                let stale_before = self.daily_cutoff(&endpoint, now);
                let lookup = cache
                    .get_or_populate(&endpoint, &info_type, stale_before, self)
                    .await?;
                let CacheMetadata {
                    created_at,
                    source,
                    fetch_duration_ms,
                    ..
                } = lookup.dataset.metadata;
                Served {
                    rows: InMemoryEvaluator.apply((*lookup.dataset.rows).clone(), &predicates),
                    fetched_at: created_at,
                    source,
                    fetch_duration_ms,
                    is_cached: lookup.hit,
                    cache_hit: Some(lookup.hit),
                }
            }
            None => {
                let fetch =
                    FetchRequest::filtered(endpoint.clone(), info_type.clone(), predicates.clone());
                let outcome = self.fetch_from_source(&endpoint, fetch).await?;
                let rows = self.normalizer.normalize(outcome.table)?;
                Served {
                    rows: PushedDownEvaluator.apply(rows, &predicates),
                    fetched_at: now,
                    source: endpoint.behavior.source.as_str().to_string(),
                    fetch_duration_ms: millis(outcome.duration),
                    is_cached: false,
                    cache_hit: None,
                }
            }
        };

        let Served {
            rows:
                RowSet {
                    columns,
                    rows,
                    refreshed_at,
                },
            fetched_at,
            source,
            fetch_duration_ms,
            is_cached,
            cache_hit,
        } = served;
        let page = paginate(rows, page, page_size)?;

        Ok(ReportResponse {
            endpoint: endpoint.name.clone(),
            info_type,
            rows: RowSet::records(&columns, &page.rows),
            columns,
            page: page.page,
            page_size: page.page_size,
            total_rows: page.total_rows,
            total_pages: page.total_pages,
            fetched_at,
            data_refreshed_at: refreshed_at,
            source,
            fetch_duration_ms,
            is_cached,
            cache_hit,
            cache_policy: directive.policy_label(),
            directive,
        })
    }

    /// Cached report endpoints expire their dataset entries at the daily cutover.
    fn daily_cutoff(
        &self,
        endpoint: &EndpointConfig,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let behavior = &endpoint.behavior;
        (behavior.tier == CacheTier::Cached && behavior.source == SourceKind::Report)
            .then(|| self.proxy.policy().cutover.last_before(now))
    }

    /// Runs one adapter fetch under the request-level timeout.
    async fn fetch_from_source(
        &self,
        endpoint: &EndpointConfig,
        request: FetchRequest,
    ) -> Result<FetchOutcome, HeraldError> {
        let kind = endpoint.behavior.source;
        let adapter = self.sources.get(kind);
        let timeout = self.request_timeout.max(adapter.timeout());
        let started = Instant::now();

        let result = match tokio::time::timeout(timeout, adapter.fetch(&request)).await {
            Ok(result) => result,
            Err(_) => Err(HeraldError::source_timeout(kind.as_str(), millis(timeout))),
        };
        metrics::record_source_fetch(
            kind.as_str(),
            result.as_ref().map(|o| o.table.len()),
            started.elapsed(),
        );
        if let Err(e) = &result {
            warn!(
                endpoint = %endpoint.name,
                source = kind.as_str(),
                full = request.want_full,
                error = %e,
                "Source fetch failed"
            );
        }
        result
    }

    /// Drops an endpoint's dataset entries; the next request fetches again.
    pub async fn refresh_one(&self, endpoint: &str) -> Result<bool, HeraldError> {
        let endpoint = self.registry.resolve(endpoint)?;
        match &self.dataset_cache {
            Some(cache) => Ok(cache.refresh_one(&endpoint.name).await?),
            None => Ok(false),
        }
    }

    /// Reloads the dataset of every endpoint that enables the dataset cache.
    pub async fn refresh_all(self: &Arc<Self>) -> Vec<RefreshReport> {
        let endpoints = self.registry.all();
        match &self.dataset_cache {
            Some(cache) => {
                cache
                    .refresh_all(endpoints, self.clone(), self.refresh_concurrency)
                    .await
            }
            None => {
                warn!("Dataset cache disabled, nothing to refresh");
                Vec::new()
            }
        }
    }

    /// Dataset cache entries with their metadata.
    pub async fn list_cached(&self) -> Result<Vec<CacheMetadata>, HeraldError> {
        match &self.dataset_cache {
            Some(cache) => Ok(cache.list_cached_endpoints().await?),
            None => Ok(Vec::new()),
        }
    }

    /// Purges the reverse-proxy cache for one endpoint or everything.
    pub async fn purge_proxy(&self, scope: &PurgeScope) -> Result<PurgeReport, HeraldError> {
        if let PurgeScope::Endpoint(name) = scope {
            self.registry.resolve(name)?;
        }
        Ok(self.proxy.purge(scope).await?)
    }

    /// Summary of every configured endpoint.
    pub fn list_endpoints(&self) -> Vec<EndpointSummary> {
        let now = Utc::now();
        self.registry
            .all()
            .iter()
            .map(|endpoint| EndpointSummary {
                name: endpoint.name.clone(),
                behavior: endpoint.behavior.to_string(),
                description: endpoint.description.clone(),
                info_types: endpoint.info_types().into_iter().map(String::from).collect(),
                filters: endpoint.filters.keys().cloned().collect(),
                page_size: endpoint.page_size,
                full_dataset_cache: endpoint.uses_dataset_cache(),
                cache_policy: self.proxy.directive_for(endpoint, "", now).policy_label(),
            })
            .collect()
    }
}

#[async_trait]
impl DatasetLoader for ReportService {
    async fn load_full(
        &self,
        endpoint: &Arc<EndpointConfig>,
        info_type: &str,
    ) -> Result<LoadedDataset, HeraldError> {
        let outcome = self
            .fetch_from_source(endpoint, FetchRequest::full(endpoint.clone(), info_type))
            .await?;
        Ok(LoadedDataset {
            rows: self.normalizer.normalize(outcome.table)?,
            source: endpoint.behavior.source.as_str().to_string(),
            fetch_duration: outcome.duration,
        })
    }
}

impl std::fmt::Debug for ReportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportService")
            .field("sources", &self.sources)
            .field("dataset_cache", &self.dataset_cache)
            .field("request_timeout", &self.request_timeout)
            .field("unknown_keys", &self.unknown_keys)
            .finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
