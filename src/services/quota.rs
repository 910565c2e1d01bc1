use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::services::redis_store::RedisStore;

/// `yyyy-mm` of the UTC calendar month containing `now`.
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

pub fn quota_key(identity: &str, month: &str) -> String {
    format!("quota:{}:{}", identity, month)
}

/// First instant of the UTC month after the one containing `now`.
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| now + chrono::Duration::days(31))
}

/// Shared monthly counters.
#[async_trait]
pub trait QuotaCounterStore: Send + Sync {
    /// Atomically adds one to `key` and returns the new value. A counter created by
    /// this call expires at `expire_at`.
    async fn increment(&self, key: &str, expire_at: DateTime<Utc>) -> Result<i64, AppError>;
}

pub struct RedisQuotaCounter {
    store: RedisStore,
}

impl RedisQuotaCounter {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QuotaCounterStore for RedisQuotaCounter {
    async fn increment(&self, key: &str, expire_at: DateTime<Utc>) -> Result<i64, AppError> {
        let count: i64 = self.store.query(redis::cmd("INCR").arg(key)).await?;

        if count == 1 {
            let expiry: Result<i64, AppError> = self
                .store
                .query(redis::cmd("EXPIREAT").arg(key).arg(expire_at.timestamp()))
                .await;
            if let Err(e) = expiry {
                // The key embeds the month, so a missing expiry only leaves an orphan behind.
                warn!(key = %key, error = %e, "Failed to set quota counter expiry");
            }
        }

        Ok(count)
    }
}

/// Monthly request quota per identity.
///
/// Counts go to the shared store when one is configured. If that store errors or
/// times out, the request is counted in a process-local map instead, which is
/// cleared whenever the calendar month changes. The local count only sees this
/// instance's traffic.
pub struct QuotaEngine {
    counter: Option<Arc<dyn QuotaCounterStore>>,
    fallback: DashMap<String, i64>,
    fallback_month: Mutex<String>,
    default_quota: i64,
}

impl QuotaEngine {
    pub fn new(counter: Option<Arc<dyn QuotaCounterStore>>, default_quota: i64) -> Self {
        Self {
            counter,
            fallback: DashMap::new(),
            // Empty until the first local count; it sorts before every month.
            fallback_month: Mutex::new(String::new()),
            default_quota,
        }
    }

    pub fn default_quota(&self) -> i64 {
        self.default_quota
    }

    pub async fn enforce(&self, identity: &str, limit: i64) -> bool {
        self.enforce_at(identity, limit, Utc::now()).await
    }

    /// Counts one request for `identity` in the month of `now`; `true` while the count is within `limit`.
    pub async fn enforce_at(&self, identity: &str, limit: i64, now: DateTime<Utc>) -> bool {
        let month = month_key(now);
        let key = quota_key(identity, &month);

        if let Some(counter) = &self.counter {
            match counter.increment(&key, next_month_start(now)).await {
                Ok(count) => {
                    debug!(identity = %identity, count, limit, "Quota counted");
                    return count <= limit;
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Quota store unavailable, counting locally");
                }
            }
        }

        // The month guard stays held across the increment so a rollover cannot
        // clear a count that was just taken.
        let _month_guard = self.roll_fallback(&month);
        let count = {
            let mut entry = self.fallback.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        count <= limit
    }

    /// Local count for `identity` in the month of `now`.
    pub fn fallback_count(&self, identity: &str, now: DateTime<Utc>) -> i64 {
        self.fallback
            .get(&quota_key(identity, &month_key(now)))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Clears the local counters when `month` is later than the tracked month.
    /// A request stamped with an earlier month never rolls the engine back.
    fn roll_fallback(&self, month: &str) -> MutexGuard<'_, String> {
        let mut current = match self.fallback_month.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // `yyyy-mm` keys sort in calendar order.
        if month > current.as_str() {
            let dropped = self.fallback.len();
            self.fallback.clear();
            info!(from = %current, to = %month, dropped, "Quota month rolled over, local counters cleared");
            *current = month.to_string();
        }
        current
    }
}
