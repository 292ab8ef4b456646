pub mod config;
pub mod metrics;
pub mod observability;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use herald_cache::{
    DatasetStore, FullDatasetCache, MemoryDatasetStore, NginxFsPurger, ProxyCacheCoordinator,
    RedisDatasetStore,
};
use herald_config::{ConfigError, EndpointRegistry};
use herald_core::{HeraldError, Normalizer};
use herald_sources::{
    HttpReportClient, PgExecutor, RelationalAdapter, ReportAdapter, SourceRegistry,
};

pub use config::{AppConfig, CacheConfig, ProxyConfig, RedisConfig, SourcesConfig};
pub use observability::{apply_logging_level, init_tracing, init_tracing_with_level};
pub use service::{EndpointSummary, ReportRequest, ReportResponse, ReportService};

/// Errors raised while assembling the service.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("endpoint catalog: {0}")]
    Catalog(#[from] ConfigError),

    #[error("source setup failed: {0}")]
    Source(#[from] HeraldError),
}

/// Create the dataset store based on configuration.
///
/// - **Redis disabled**: in-process store
/// - **Redis enabled**: connects to Redis, falls back to the in-process store on failure
pub async fn create_dataset_store(config: &RedisConfig) -> Arc<dyn DatasetStore> {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-process dataset store");
        return Arc::new(MemoryDatasetStore::new());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let timeout = Duration::from_millis(config.timeout_ms);
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool, falling back to in-process store"
            );
            return Arc::new(MemoryDatasetStore::new());
        }
    };

    let store = RedisDatasetStore::new(pool);
    if store.ping().await {
        tracing::info!("Connected to Redis");
        Arc::new(store)
    } else {
        tracing::warn!("Failed to connect to Redis, falling back to in-process store");
        Arc::new(MemoryDatasetStore::new())
    }
}

/// Registers an adapter for every source with a configured connection.
///
/// Relational-A has no driver wired here; it answers `SourceUnavailable`
/// until an executor is registered with [`RelationalAdapter::mssql`].
pub fn build_sources(
    config: &SourcesConfig,
    normalizer: &Normalizer,
) -> Result<(SourceRegistry, Option<Arc<ReportAdapter>>), HeraldError> {
    let mut sources = SourceRegistry::new();

    if config.postgres.is_configured() {
        let executor = PgExecutor::connect_lazy(&config.postgres)?;
        let adapter = RelationalAdapter::postgres(
            Arc::new(executor),
            Duration::from_millis(config.postgres.query_timeout_ms),
        )
        .with_normalizer(normalizer.clone());
        sources.register(Arc::new(adapter));
    }

    let report = if config.report.is_configured() {
        let client = HttpReportClient::new(config.report.clone())?;
        let adapter = Arc::new(ReportAdapter::new(
            Arc::new(client),
            Duration::from_millis(config.report.timeout_ms),
        ));
        sources.register(adapter.clone());
        Some(adapter)
    } else {
        None
    };

    tracing::debug!(sources = ?sources, "Source adapters registered");
    Ok((sources, report))
}

/// Everything a command needs, built once at startup.
pub struct HeraldApp {
    pub config: AppConfig,
    pub registry: Arc<EndpointRegistry>,
    pub service: Arc<ReportService>,
    /// Present when the report API is configured; used for introspection.
    pub report_adapter: Option<Arc<ReportAdapter>>,
}

impl HeraldApp {
    /// Wires catalog, sources and cache tiers from configuration.
    pub async fn build(config: AppConfig) -> Result<Self, StartupError> {
        let registry = Arc::new(EndpointRegistry::from_path(&config.endpoints.path)?);
        tracing::info!(
            path = %config.endpoints.path.display(),
            endpoints = registry.snapshot().len(),
            "Endpoint catalog loaded"
        );

        let normalizer = Normalizer::new(config.normalizer_options());
        let (sources, report_adapter) = build_sources(&config.sources, &normalizer)?;

        let policy = config.proxy_policy().map_err(StartupError::Config)?;
        let purger =
            NginxFsPurger::new(config.proxy.cache_dirs.clone(), policy.key_prefix.clone());
        let proxy = Arc::new(ProxyCacheCoordinator::new(policy, Arc::new(purger)));

        let mut service = ReportService::new(registry.clone(), sources, proxy)
            .with_normalizer(normalizer)
            .with_request_timeout(config.request_timeout())
            .with_unknown_filter_policy(config.filters.unknown_keys)
            .with_refresh_concurrency(config.cache.refresh_concurrency);

        if config.cache.enabled {
            let store = create_dataset_store(&config.redis).await;
            let cache = FullDatasetCache::new(store, config.dataset_ttl());
            service = service.with_dataset_cache(Arc::new(cache));
        }

        Ok(Self {
            config,
            registry,
            service: Arc::new(service),
            report_adapter,
        })
    }
}
