//! Key-value contract behind the full-dataset cache.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herald_core::HeraldError;

/// Errors raised by a dataset store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The backing store could not be reached or rejected the command.
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded.
    #[error("cache codec error: {0}")]
    Codec(String),
}

impl From<CacheError> for HeraldError {
    fn from(err: CacheError) -> Self {
        HeraldError::cache_unavailable(err.to_string())
    }
}

/// Metadata stored next to every cached dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub endpoint: String,
    pub info_type: String,
    /// Source identifier, e.g. `relational-b`.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub fetch_duration_ms: u64,
    pub row_count: usize,
    /// Size of the encoded row set.
    pub byte_size: usize,
    /// Refresh time reported by the source itself.
    #[serde(default)]
    pub refreshed_at: Option<String>,
    /// Remaining time to live; filled in when listing entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_remaining_secs: Option<u64>,
}

/// An encoded row set and its metadata, always written together.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDataset {
    pub metadata: CacheMetadata,
    pub payload: Vec<u8>,
}

/// Storage for full datasets.
///
/// `replace` swaps the whole value atomically; readers never observe a
/// payload from one write with metadata from another.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Short name for logs, e.g. `memory` or `redis`.
    fn backend_name(&self) -> &'static str;

    async fn load(&self, key: &str) -> Result<Option<StoredDataset>, CacheError>;

    async fn replace(
        &self,
        key: &str,
        dataset: StoredDataset,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Returns true if an entry existed.
    async fn remove(&self, key: &str) -> Result<bool, CacheError>;

    /// Keys of all live entries.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Metadata and remaining time to live, without loading the payload.
    async fn metadata(
        &self,
        key: &str,
    ) -> Result<Option<(CacheMetadata, Option<Duration>)>, CacheError>;
}
