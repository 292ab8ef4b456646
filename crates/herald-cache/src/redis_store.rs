//! Redis dataset store.
//!
//! Each dataset lives under two keys sharing one TTL:
//! `herald:data:<key>` holds the encoded rows and `herald:meta:<key>` the
//! JSON metadata. Both are written, and read back, in a single MULTI/EXEC so
//! a reader sees either the old pair or the new pair.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tracing::debug;

use crate::store::{CacheError, CacheMetadata, DatasetStore, StoredDataset};

const DEFAULT_NAMESPACE: &str = "herald";
const SCAN_COUNT: usize = 200;

/// [`DatasetStore`] backed by a deadpool Redis pool.
#[derive(Clone)]
pub struct RedisDatasetStore {
    pool: Pool,
    namespace: String,
}

impl RedisDatasetStore {
    pub fn new(pool: Pool) -> Self {
        Self::with_namespace(pool, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}:data:{key}", self.namespace)
    }

    fn meta_key(&self, key: &str) -> String {
        format!("{}:meta:{key}", self.namespace)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(format!("failed to get Redis connection: {e}")))
    }

    /// Reads payload and metadata in one MULTI/EXEC.
    fn load_pipeline(&self, key: &str) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic().get(self.data_key(key)).get(self.meta_key(key));
        pipe
    }

    /// Reads metadata and the payload TTL in one MULTI/EXEC.
    fn metadata_pipeline(&self, key: &str) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic().get(self.meta_key(key)).ttl(self.data_key(key));
        pipe
    }

    /// Checks that a connection can be acquired.
    pub async fn ping(&self) -> bool {
        self.pool.get().await.is_ok()
    }
}

fn unavailable(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

fn decode_metadata(raw: &str) -> Result<CacheMetadata, CacheError> {
    serde_json::from_str(raw)
        .map_err(|e| CacheError::Codec(format!("invalid cache metadata: {e}")))
}

#[async_trait]
impl DatasetStore for RedisDatasetStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn load(&self, key: &str) -> Result<Option<StoredDataset>, CacheError> {
        let mut conn = self.connection().await?;
        let (payload, meta): (Option<Vec<u8>>, Option<String>) = self
            .load_pipeline(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match (payload, meta) {
            (Some(payload), Some(meta)) => Ok(Some(StoredDataset {
                metadata: decode_metadata(&meta)?,
                payload,
            })),
            _ => Ok(None),
        }
    }

    async fn replace(
        &self,
        key: &str,
        dataset: StoredDataset,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let meta = serde_json::to_string(&dataset.metadata)
            .map_err(|e| CacheError::Codec(e.to_string()))?;
        let ttl_secs = ttl.as_secs().max(1);

        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .set_ex(self.data_key(key), dataset.payload, ttl_secs)
            .ignore()
            .set_ex(self.meta_key(key), meta, ttl_secs)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(unavailable)?;
        debug!(key = %key, ttl_secs, "Dataset stored in Redis");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let removed: usize = conn
            .del(vec![self.data_key(key), self.meta_key(key)])
            .await
            .map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection().await?;
        let prefix = self.meta_key("");
        let pattern = format!("{prefix}*");

        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn metadata(
        &self,
        key: &str,
    ) -> Result<Option<(CacheMetadata, Option<Duration>)>, CacheError> {
        let mut conn = self.connection().await?;
        let (meta, ttl): (Option<String>, i64) = self
            .metadata_pipeline(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let Some(meta) = meta else {
            return Ok(None);
        };
        // -2: data key gone, -1: no expiry
        if ttl == -2 {
            return Ok(None);
        }
        let remaining = u64::try_from(ttl).ok().map(Duration::from_secs);
        Ok(Some((decode_metadata(&meta)?, remaining)))
    }
}
