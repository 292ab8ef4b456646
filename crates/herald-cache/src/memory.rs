//! In-process dataset store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::store::{CacheError, CacheMetadata, DatasetStore, StoredDataset};

#[derive(Debug, Clone)]
struct MemoryEntry {
    dataset: Arc<StoredDataset>,
    expires_at: Instant,
}

impl MemoryEntry {
    fn remaining(&self) -> Option<Duration> {
        self.expires_at.checked_duration_since(Instant::now())
    }
}

/// [`DatasetStore`] over a `DashMap` with per-entry expiry.
///
/// Used when Redis is disabled or unreachable. Entries are not shared
/// between processes.
#[derive(Debug, Default, Clone)]
pub struct MemoryDatasetStore {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(&self, key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.get(key)?.clone();
        if entry.remaining().is_none() {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl DatasetStore for MemoryDatasetStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<StoredDataset>, CacheError> {
        Ok(self.live(key).map(|e| (*e.dataset).clone()))
    }

    async fn replace(
        &self,
        key: &str,
        dataset: StoredDataset,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                dataset: Arc::new(dataset),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| e.remaining().is_some()))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.entries.retain(|_, e| e.remaining().is_some());
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn metadata(
        &self,
        key: &str,
    ) -> Result<Option<(CacheMetadata, Option<Duration>)>, CacheError> {
        Ok(self
            .live(key)
            .map(|e| (e.dataset.metadata.clone(), e.remaining())))
    }
}
