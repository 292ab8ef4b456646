//! # herald-cache
//!
//! The two cache tiers in front of the Herald sources.
//!
//! - [`FullDatasetCache`]: an optional store of whole unfiltered datasets
//!   per endpoint, filtered and paginated in memory on every hit. Backed by
//!   Redis when configured, by an in-process map otherwise.
//! - [`ProxyCacheCoordinator`]: decides how an external reverse proxy may
//!   cache each response and purges what it stored.
//!
//! Both tiers are optimizations. A failing store degrades to a miss and
//! never fails a request.

pub mod dataset;
pub mod memory;
pub mod metrics;
pub mod proxy;
pub mod redis_store;
pub mod store;

pub use dataset::{
    CachedDataset, DEFAULT_DATASET_TTL, DatasetLoader, DatasetLookup, FullDatasetCache,
    LoadedDataset, RefreshOutcome, RefreshReport, dataset_key,
};
pub use memory::MemoryDatasetStore;
pub use proxy::{
    CacheValidity, DailyCutover, NginxFsPurger, ProxyCacheCoordinator, ProxyCacheDirective,
    ProxyCachePolicy, ProxyPurger, PurgeReport, PurgeScope,
};
pub use redis_store::RedisDatasetStore;
pub use store::{CacheError, CacheMetadata, DatasetStore, StoredDataset};
