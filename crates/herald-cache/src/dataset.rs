//! Full-dataset cache.
//!
//! Holds the entire unfiltered row set of an endpoint per info type, keyed
//! `<endpoint>:<info_type>`. Rows are encoded with MessagePack and written
//! together with their metadata in one atomic replace.
//!
//! The cache never fails a request: store errors are logged and degrade to a
//! miss. Concurrent misses on one key are collapsed behind a per-key async
//! mutex so only the first caller runs the full fetch; the others wait and
//! read what it stored. When the store is down there is nothing to wait for,
//! so every caller fetches for itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{StreamExt, stream};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use herald_config::EndpointConfig;
use herald_core::{HeraldError, RowSet};

use crate::metrics;
use crate::store::{CacheError, CacheMetadata, DatasetStore, StoredDataset};

/// Default time to live of a dataset entry.
pub const DEFAULT_DATASET_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Store key of one endpoint/info type pair.
#[must_use]
pub fn dataset_key(endpoint: &str, info_type: &str) -> String {
    format!("{endpoint}:{info_type}")
}

/// Rows read from or written to the cache.
#[derive(Debug, Clone)]
pub struct CachedDataset {
    pub rows: Arc<RowSet>,
    pub metadata: CacheMetadata,
}

/// Result of a full unfiltered fetch.
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub rows: RowSet,
    pub source: String,
    pub fetch_duration: Duration,
}

/// Outcome of [`FullDatasetCache::get_or_populate`].
#[derive(Debug, Clone)]
pub struct DatasetLookup {
    pub dataset: CachedDataset,
    /// True when the rows were already cached.
    pub hit: bool,
}

/// Performs the full fetch when an entry is missing or being refreshed.
#[async_trait]
pub trait DatasetLoader: Send + Sync {
    async fn load_full(
        &self,
        endpoint: &Arc<EndpointConfig>,
        info_type: &str,
    ) -> Result<LoadedDataset, HeraldError>;
}

/// Per-endpoint result of [`FullDatasetCache::refresh_all`].
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Refreshed { info_types: Vec<String>, rows: usize },
    SkippedNotEnabled,
    Failed(HeraldError),
}

impl RefreshOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refreshed { .. } => "refreshed",
            Self::SkippedNotEnabled => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub endpoint: String,
    pub outcome: RefreshOutcome,
    pub duration: Duration,
}

impl RefreshReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RefreshOutcome::Refreshed { .. })
    }
}

/// The full-dataset cache tier.
pub struct FullDatasetCache {
    store: Arc<dyn DatasetStore>,
    ttl: Duration,
    populate_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FullDatasetCache {
    pub fn new(store: Arc<dyn DatasetStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            populate_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DatasetStore> {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reads an entry.
    pub async fn get(
        &self,
        endpoint: &str,
        info_type: &str,
    ) -> Result<Option<CachedDataset>, CacheError> {
        let Some(stored) = self.store.load(&dataset_key(endpoint, info_type)).await? else {
            return Ok(None);
        };
        let rows: RowSet = rmp_serde::from_slice(&stored.payload)
            .map_err(|e| CacheError::Codec(format!("failed to decode dataset: {e}")))?;
        Ok(Some(CachedDataset {
            rows: Arc::new(rows),
            metadata: stored.metadata,
        }))
    }

    /// Overwrites an entry wholesale and resets its TTL.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn set(
        &self,
        endpoint: &str,
        info_type: &str,
        rows: &RowSet,
        source: &str,
        fetch_duration: Duration,
    ) -> Result<CacheMetadata, CacheError> {
        let payload = rmp_serde::to_vec(rows)
            .map_err(|e| CacheError::Codec(format!("failed to encode dataset: {e}")))?;
        let metadata =
            new_metadata(endpoint, info_type, rows, source, fetch_duration, payload.len());
        self.store
            .replace(
                &dataset_key(endpoint, info_type),
                StoredDataset {
                    metadata: metadata.clone(),
                    payload,
                },
                self.ttl,
            )
            .await?;
        info!(
            backend = self.store.backend_name(),
            bytes = metadata.byte_size,
            "Dataset cached"
        );
        Ok(metadata)
    }

    /// Removes every info type of an endpoint. True if anything was removed.
    pub async fn delete(&self, endpoint: &str) -> Result<bool, CacheError> {
        let prefix = dataset_key(endpoint, "");
        let mut removed = false;
        for key in self.store.keys().await? {
            if key.starts_with(&prefix) {
                removed |= self.store.remove(&key).await?;
            }
        }
        debug!(endpoint = %endpoint, removed, "Dataset cache entries deleted");
        Ok(removed)
    }

    /// Drops an endpoint's entries so the next read fetches again.
    pub async fn refresh_one(&self, endpoint: &str) -> Result<bool, CacheError> {
        self.delete(endpoint).await
    }

    /// Metadata of every live entry, with the remaining TTL filled in.
    pub async fn list_cached_endpoints(&self) -> Result<Vec<CacheMetadata>, CacheError> {
        let mut entries = Vec::new();
        for key in self.store.keys().await? {
            if let Some((mut metadata, ttl)) = self.store.metadata(&key).await? {
                metadata.ttl_remaining_secs = ttl.map(|t| t.as_secs());
                entries.push(metadata);
            }
        }
        metrics::set_dataset_entries(entries.len());
        Ok(entries)
    }

    /// Serves an endpoint's full dataset, populating it on a miss.
    ///
    /// Entries created before `stale_before` count as misses. Loader errors
    /// propagate; store errors do not.
    #[instrument(skip(self, endpoint, loader), fields(endpoint = %endpoint.name))]
    pub async fn get_or_populate(
        &self,
        endpoint: &Arc<EndpointConfig>,
        info_type: &str,
        stale_before: Option<DateTime<Utc>>,
        loader: &dyn DatasetLoader,
    ) -> Result<DatasetLookup, HeraldError> {
        match self.lookup_fresh(&endpoint.name, info_type, stale_before).await {
            Ok(Some(dataset)) => {
                metrics::record_cache_hit("dataset");
                return Ok(DatasetLookup { dataset, hit: true });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Dataset cache unavailable, fetching from source");
                metrics::record_cache_error("get");
                let dataset = self.load_and_store(endpoint, info_type, loader).await?;
                return Ok(DatasetLookup { dataset, hit: false });
            }
        }

        let key = dataset_key(&endpoint.name, info_type);
        let lock = self.populate_lock(&key);
        let guard = lock.lock().await;

        let result = match self.lookup_fresh(&endpoint.name, info_type, stale_before).await {
            Ok(Some(dataset)) => {
                debug!("Dataset populated by a concurrent request");
                metrics::record_cache_hit("dataset");
                Ok(DatasetLookup { dataset, hit: true })
            }
            other => {
                if let Err(e) = other {
                    warn!(error = %e, "Dataset cache re-check failed, fetching from source");
                    metrics::record_cache_error("get");
                }
                metrics::record_cache_miss("dataset");
                self.load_and_store(endpoint, info_type, loader)
                    .await
                    .map(|dataset| DatasetLookup { dataset, hit: false })
            }
        };

        drop(guard);
        drop(lock);
        self.release_lock(&key);
        result
    }

    /// Refreshes every endpoint that enables the dataset cache.
    ///
    /// Endpoints are refreshed independently with at most `concurrency` in
    /// flight; reports keep the input order.
    pub async fn refresh_all(
        &self,
        endpoints: Vec<Arc<EndpointConfig>>,
        loader: Arc<dyn DatasetLoader>,
        concurrency: usize,
    ) -> Vec<RefreshReport> {
        let loader = loader.as_ref();
        let mut reports: Vec<(usize, RefreshReport)> =
            stream::iter(endpoints.into_iter().enumerate())
                .map(|(index, endpoint)| async move {
                    (index, self.refresh_endpoint(&endpoint, loader).await)
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;
        reports.sort_by_key(|(index, _)| *index);

        let reports: Vec<RefreshReport> = reports.into_iter().map(|(_, r)| r).collect();
        let failed = reports
            .iter()
            .filter(|r| matches!(r.outcome, RefreshOutcome::Failed(_)))
            .count();
        info!(endpoints = reports.len(), failed, "Dataset refresh finished");
        reports
    }

    async fn refresh_endpoint(
        &self,
        endpoint: &Arc<EndpointConfig>,
        loader: &dyn DatasetLoader,
    ) -> RefreshReport {
        let started = Instant::now();
        let outcome = if endpoint.uses_dataset_cache() {
            match self.refresh_info_types(endpoint, loader).await {
                Ok((info_types, rows)) => RefreshOutcome::Refreshed { info_types, rows },
                Err(error) => {
                    warn!(endpoint = %endpoint.name, error = %error, "Dataset refresh failed");
                    RefreshOutcome::Failed(error)
                }
            }
        } else {
            RefreshOutcome::SkippedNotEnabled
        };
        metrics::record_refresh(outcome.as_str());
        RefreshReport {
            endpoint: endpoint.name.clone(),
            outcome,
            duration: started.elapsed(),
        }
    }

    async fn refresh_info_types(
        &self,
        endpoint: &Arc<EndpointConfig>,
        loader: &dyn DatasetLoader,
    ) -> Result<(Vec<String>, usize), HeraldError> {
        let mut info_types = Vec::new();
        let mut rows = 0;
        for info_type in endpoint.info_types() {
            let key = dataset_key(&endpoint.name, info_type);
            let lock = self.populate_lock(&key);
            let guard = lock.lock().await;
            let result = async {
                let loaded = loader.load_full(endpoint, info_type).await?;
                self.set(
                    &endpoint.name,
                    info_type,
                    &loaded.rows,
                    &loaded.source,
                    loaded.fetch_duration,
                )
                .await?;
                Ok::<_, HeraldError>(loaded.rows.len())
            }
            .await;
            drop(guard);
            drop(lock);
            self.release_lock(&key);

            rows += result?;
            info_types.push(info_type.to_string());
        }
        Ok((info_types, rows))
    }

    async fn lookup_fresh(
        &self,
        endpoint: &str,
        info_type: &str,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<CachedDataset>, CacheError> {
        Ok(self.get(endpoint, info_type).await?.filter(|dataset| {
            let fresh = stale_before.is_none_or(|cutoff| dataset.metadata.created_at >= cutoff);
            if !fresh {
                debug!(
                    created_at = %dataset.metadata.created_at,
                    "Dataset entry is past its cutover"
                );
            }
            fresh
        }))
    }

    async fn load_and_store(
        &self,
        endpoint: &Arc<EndpointConfig>,
        info_type: &str,
        loader: &dyn DatasetLoader,
    ) -> Result<CachedDataset, HeraldError> {
        let loaded = loader.load_full(endpoint, info_type).await?;
        let metadata = match self
            .set(
                &endpoint.name,
                info_type,
                &loaded.rows,
                &loaded.source,
                loaded.fetch_duration,
            )
            .await
        {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "Failed to store dataset, serving uncached rows");
                metrics::record_cache_error("set");
                new_metadata(
                    &endpoint.name,
                    info_type,
                    &loaded.rows,
                    &loaded.source,
                    loaded.fetch_duration,
                    0,
                )
            }
        };
        Ok(CachedDataset {
            rows: Arc::new(loaded.rows),
            metadata,
        })
    }

    fn populate_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.populate_locks.entry(key.to_string()).or_default().clone()
    }

    fn release_lock(&self, key: &str) {
        self.populate_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl std::fmt::Debug for FullDatasetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullDatasetCache")
            .field("backend", &self.store.backend_name())
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn new_metadata(
    endpoint: &str,
    info_type: &str,
    rows: &RowSet,
    source: &str,
    fetch_duration: Duration,
    byte_size: usize,
) -> CacheMetadata {
    CacheMetadata {
        endpoint: endpoint.to_string(),
        info_type: info_type.to_string(),
        source: source.to_string(),
        created_at: Utc::now(),
        fetch_duration_ms: u64::try_from(fetch_duration.as_millis()).unwrap_or(u64::MAX),
        row_count: rows.len(),
        byte_size,
        refreshed_at: rows.refreshed_at.clone(),
        ttl_remaining_secs: None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::MemoryDatasetStore;
    use herald_config::EndpointCatalog;
    use herald_core::CellValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Loader that counts calls and can fail for chosen endpoints.
    #[derive(Default)]
    pub(crate) struct CountingLoader {
        pub calls: AtomicUsize,
        pub delay: Duration,
        pub failing: Vec<String>,
    }

    #[async_trait]
    impl DatasetLoader for CountingLoader {
        async fn load_full(
            &self,
            endpoint: &Arc<EndpointConfig>,
            _info_type: &str,
        ) -> Result<LoadedDataset, HeraldError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.failing.contains(&endpoint.name) {
                return Err(HeraldError::source_unavailable("relational-b", "connection refused"));
            }
            Ok(LoadedDataset {
                rows: RowSet {
                    columns: vec!["region".into(), "qty".into()],
                    rows: vec![
                        vec!["EMEA".into(), CellValue::Integer(3)],
                        vec!["APAC".into(), CellValue::Integer(4)],
                    ],
                    refreshed_at: Some("2024-03-01 07:00:00".into()),
                },
                source: "relational-b".into(),
                fetch_duration: Duration::from_millis(5),
            })
        }
    }

    /// Store whose every operation fails.
    pub(crate) struct DownStore;

    #[async_trait]
    impl DatasetStore for DownStore {
        fn backend_name(&self) -> &'static str {
            "down"
        }
        async fn load(&self, _key: &str) -> Result<Option<StoredDataset>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn replace(
            &self,
            _key: &str,
            _d: StoredDataset,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn remove(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn keys(&self) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn metadata(
            &self,
            _key: &str,
        ) -> Result<Option<(CacheMetadata, Option<Duration>)>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    fn catalog() -> EndpointCatalog {
        EndpointCatalog::from_toml_str(
            r#"
[endpoints.inventory]
behavior = "cachepg"
full_dataset_cache = true
[endpoints.inventory.relational]
table = "inventory"

[endpoints.orders]
behavior = "cachepg"
full_dataset_cache = true
[endpoints.orders.relational]
table = "orders"

[endpoints.live_stock]
behavior = "livepg"
[endpoints.live_stock.relational]
table = "stock"
"#,
        )
        .unwrap()
    }

    fn cache() -> FullDatasetCache {
        FullDatasetCache::new(Arc::new(MemoryDatasetStore::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_set_then_get_returns_identical_rows() {
        let cache = cache();
        let loaded = CountingLoader::default()
            .load_full(catalog().get("inventory").unwrap(), "summary")
            .await
            .unwrap();
        let meta = cache
            .set("inventory", "summary", &loaded.rows, "relational-b", loaded.fetch_duration)
            .await
            .unwrap();
        assert_eq!(meta.row_count, 2);
        assert!(meta.byte_size > 0);
        assert_eq!(meta.refreshed_at.as_deref(), Some("2024-03-01 07:00:00"));

        let cached = cache.get("inventory", "summary").await.unwrap().unwrap();
        assert_eq!(*cached.rows, loaded.rows);
        assert_eq!(cached.metadata, meta);
    }

    #[tokio::test]
    async fn test_delete_covers_every_info_type() {
        let cache = cache();
        let rows = RowSet::default();
        for info_type in ["summary", "detail"] {
            cache
                .set("sales", info_type, &rows, "report", Duration::ZERO)
                .await
                .unwrap();
        }
        cache
            .set("sales2", "summary", &rows, "report", Duration::ZERO)
            .await
            .unwrap();

        assert!(cache.delete("sales").await.unwrap());
        assert!(!cache.delete("sales").await.unwrap());
        let listed = cache.list_cached_endpoints().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].endpoint, "sales2");
        assert!(listed[0].ttl_remaining_secs.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let cache = Arc::new(cache());
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let endpoint = catalog().get("inventory").unwrap().clone();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let loader = loader.clone();
                let endpoint = endpoint.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_populate(&endpoint, "summary", None, loader.as_ref())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut misses = 0;
        for task in tasks {
            let lookup = task.await.unwrap();
            assert_eq!(lookup.dataset.rows.len(), 2);
            if !lookup.hit {
                misses += 1;
            }
        }
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(misses, 1);
        assert!(cache.populate_locks.is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_degrades_to_fetch() {
        let cache = FullDatasetCache::new(Arc::new(DownStore), Duration::from_secs(60));
        let loader = CountingLoader::default();
        let endpoint = catalog().get("inventory").unwrap().clone();

        let lookup = cache
            .get_or_populate(&endpoint, "summary", None, &loader)
            .await
            .unwrap();
        assert!(!lookup.hit);
        assert_eq!(lookup.dataset.rows.len(), 2);
        assert_eq!(lookup.dataset.metadata.byte_size, 0);
    }

    #[tokio::test]
    async fn test_entries_before_cutoff_are_stale() {
        let cache = cache();
        let loader = CountingLoader::default();
        let endpoint = catalog().get("inventory").unwrap().clone();

        cache.get_or_populate(&endpoint, "summary", None, &loader).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let lookup = cache
            .get_or_populate(&endpoint, "summary", Some(cutoff), &loader)
            .await
            .unwrap();
        assert!(!lookup.hit);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loader_errors_propagate() {
        let cache = cache();
        let loader = CountingLoader {
            failing: vec!["inventory".into()],
            ..Default::default()
        };
        let endpoint = catalog().get("inventory").unwrap().clone();
        let err = cache
            .get_or_populate(&endpoint, "summary", None, &loader)
            .await
            .unwrap_err();
        assert!(matches!(err, HeraldError::SourceUnavailable { .. }));
        assert!(cache.get("inventory", "summary").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_all_isolates_failures() {
        let cache = cache();
        let loader = Arc::new(CountingLoader {
            failing: vec!["orders".into()],
            ..Default::default()
        });
        let endpoints: Vec<_> = catalog().iter().cloned().collect();

        let reports = cache.refresh_all(endpoints, loader, 2).await;
        let mut outcomes: Vec<_> = reports
            .iter()
            .map(|r| (r.endpoint.as_str(), r.outcome.as_str()))
            .collect();
        outcomes.sort();
        assert_eq!(
            outcomes,
            vec![
                ("inventory", "refreshed"),
                ("live_stock", "skipped"),
                ("orders", "failed"),
            ]
        );
        assert!(cache.get("inventory", "summary").await.unwrap().is_some());
        assert!(cache.get("orders", "summary").await.unwrap().is_none());
    }
}
