use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::AppError;
use crate::models::ApiKeyRecord;
use crate::services::redis_store::RedisStore;

pub const CACHE_KEY_PREFIX: &str = "aegis:apikey:";

pub fn cache_key(key_hash: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, key_hash)
}

/// Short-lived store of resolved API key records, keyed by key hash.
#[async_trait]
pub trait KeyCache: Send + Sync {
    async fn get(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, AppError>;
    async fn put(&self, record: &ApiKeyRecord, ttl: Duration) -> Result<(), AppError>;
    /// Removing an absent entry is not an error.
    async fn remove(&self, key_hash: &str) -> Result<(), AppError>;
}

/// Redis-backed cache shared by every gateway instance. Values are the JSON form of the record.
pub struct RedisKeyCache {
    store: RedisStore,
}

impl RedisKeyCache {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KeyCache for RedisKeyCache {
    async fn get(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, AppError> {
        let raw: Option<String> = self
            .store
            .query(redis::cmd("GET").arg(cache_key(key_hash)))
            .await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &ApiKeyRecord, ttl: Duration) -> Result<(), AppError> {
        let payload = serde_json::to_string(record)?;
        let ttl_secs = ttl.as_secs().max(1);
        let _: () = self
            .store
            .query(
                redis::cmd("SET")
                    .arg(cache_key(&record.key_hash))
                    .arg(payload)
                    .arg("EX")
                    .arg(ttl_secs),
            )
            .await?;
        debug!(key_id = record.id, ttl_secs, "Cached api key record");
        Ok(())
    }

    async fn remove(&self, key_hash: &str) -> Result<(), AppError> {
        let removed: i64 = self
            .store
            .query(redis::cmd("DEL").arg(cache_key(key_hash)))
            .await?;
        debug!(removed, "Removed api key cache entry");
        Ok(())
    }
}

/// Process-local cache used when no Redis address is configured.
#[derive(Default)]
pub struct InMemoryKeyCache {
    entries: DashMap<String, (ApiKeyRecord, Instant)>,
}

impl InMemoryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyCache for InMemoryKeyCache {
    async fn get(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, AppError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key_hash)
            .map(|entry| (entry.value().0.clone(), entry.value().1 > now));

        match hit {
            Some((record, true)) => Ok(Some(record)),
            Some((_, false)) => {
                self.entries.remove_if(key_hash, |_, (_, expires_at)| *expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: &ApiKeyRecord, ttl: Duration) -> Result<(), AppError> {
        self.entries
            .insert(record.key_hash.clone(), (record.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn remove(&self, key_hash: &str) -> Result<(), AppError> {
        self.entries.remove(key_hash);
        Ok(())
    }
}
