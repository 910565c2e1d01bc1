use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::db::repositories::KeyDirectory;
use crate::error::AppError;
use crate::models::ApiKeyRecord;
use crate::security::api_key_hashing::hash_api_key;
use crate::services::key_cache::KeyCache;

/// Turns a presented secret into a key record: cache first, directory on miss.
///
/// Only active records are written back to the cache, so disabling a key in the
/// directory takes effect on the next lookup once its cache entry is gone. A
/// failing cache is treated as a miss; a failing directory is an error.
pub struct ApiKeyResolver {
    directory: Arc<dyn KeyDirectory>,
    cache: Arc<dyn KeyCache>,
    cache_ttl: Duration,
}

impl ApiKeyResolver {
    pub fn new(directory: Arc<dyn KeyDirectory>, cache: Arc<dyn KeyCache>, cache_ttl: Duration) -> Self {
        Self {
            directory,
            cache,
            cache_ttl,
        }
    }

    /// `Err(InvalidApiKey)` when no key matches, `Err(Database)` when the directory is unreachable.
    /// Inactive keys are returned as found; rejecting them is the caller's decision.
    pub async fn resolve(&self, raw_key: &str) -> Result<ApiKeyRecord, AppError> {
        let key_hash = hash_api_key(raw_key);

        match self.cache.get(&key_hash).await {
            Ok(Some(record)) => {
                debug!(key_id = record.id, "API key resolved from cache");
                return Ok(record);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "API key cache read failed, falling back to directory");
            }
        }

        let record = match self.directory.find_by_hash(&key_hash).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(AppError::InvalidApiKey),
            Err(e) => {
                error!(error = %e, "API key directory lookup failed");
                return Err(e);
            }
        };

        if record.active {
            if let Err(e) = self.cache.put(&record, self.cache_ttl).await {
                warn!(key_id = record.id, error = %e, "Failed to cache api key record");
            }
        }

        Ok(record)
    }

    /// Drops the cached record for `key_hash`; the next request re-reads the directory.
    pub async fn invalidate(&self, key_hash: &str) -> Result<(), AppError> {
        self.cache.remove(key_hash).await?;
        let key_hash_prefix: String = key_hash.chars().take(8).collect();
        info!(key_hash_prefix = %key_hash_prefix, "API key cache entry invalidated");
        Ok(())
    }
}
