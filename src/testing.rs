//! In-memory stand-ins for the gateway's external stores, with call counters
//! and failure switches.

use actix_web::dev::ServiceRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::PublishPolicy;
use crate::db::repositories::KeyDirectory;
use crate::error::AppError;
use crate::models::{ApiKeyRecord, AppState, RequestContext, UsageEvent};
use crate::security::api_key_hashing::hash_api_key;
use crate::services::quota::QuotaCounterStore;
use crate::services::{
    ApiKeyResolver, EventSink, KeyCache, ProxyDirector, QuotaEngine, RateLimiterRegistry, ReadinessFlag,
    UsagePublisher,
};

pub const TEST_KEY_ID_HEADER: &str = "x-test-key-id";

pub fn api_key_record(id: i64, raw_key: &str, upstream_host: &str, active: bool, monthly_quota: i64) -> ApiKeyRecord {
    ApiKeyRecord {
        id,
        key_hash: hash_api_key(raw_key),
        name: format!("key-{}", id),
        upstream_host: upstream_host.to_string(),
        active,
        monthly_quota,
        created_at: Utc::now(),
    }
}

/// Marks a request as authenticated with the key id named in `x-test-key-id`,
/// for exercising stages that sit behind authentication.
pub fn authenticate_from_header(req: &ServiceRequest) {
    let id = req
        .headers()
        .get(TEST_KEY_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());

    if let Some(id) = id {
        let record = api_key_record(id, &format!("KEY_{}", id), "", true, 0);
        RequestContext::current(req).with_api_key(Arc::new(record)).store(req);
    }
}

#[derive(Default)]
pub struct FakeKeyDirectory {
    records: Mutex<HashMap<String, ApiKeyRecord>>,
    lookups: AtomicUsize,
    failing: AtomicBool,
}

impl FakeKeyDirectory {
    pub fn with_records(records: Vec<ApiKeyRecord>) -> Self {
        let directory = Self::default();
        {
            let mut map = directory.records.lock().unwrap();
            for record in records {
                map.insert(record.key_hash.clone(), record);
            }
        }
        directory
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_active(&self, key_hash: &str, active: bool) {
        if let Some(record) = self.records.lock().unwrap().get_mut(key_hash) {
            record.active = active;
        }
    }
}

#[async_trait]
impl KeyDirectory for FakeKeyDirectory {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, AppError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Database("connection refused".to_string()));
        }
        Ok(self.records.lock().unwrap().get(key_hash).cloned())
    }
}

#[derive(Default)]
pub struct FakeKeyCache {
    entries: Mutex<HashMap<String, ApiKeyRecord>>,
    puts: AtomicUsize,
    failing: AtomicBool,
}

impl FakeKeyCache {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AppError::Cache("cache offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyCache for FakeKeyCache {
    async fn get(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, AppError> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(key_hash).cloned())
    }

    async fn put(&self, record: &ApiKeyRecord, _ttl: Duration) -> Result<(), AppError> {
        self.check()?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(record.key_hash.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, key_hash: &str) -> Result<(), AppError> {
        self.check()?;
        self.entries.lock().unwrap().remove(key_hash);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCounterStore {
    counters: Mutex<HashMap<String, (i64, Option<DateTime<Utc>>)>>,
    failing: AtomicBool,
}

impl FakeCounterStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn count(&self, key: &str) -> i64 {
        self.counters.lock().unwrap().get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    pub fn expiry(&self, key: &str) -> Option<DateTime<Utc>> {
        self.counters.lock().unwrap().get(key).and_then(|(_, expiry)| *expiry)
    }
}

#[async_trait]
impl QuotaCounterStore for FakeCounterStore {
    async fn increment(&self, key: &str, expire_at: DateTime<Utc>) -> Result<i64, AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Cache("counter store offline".to_string()));
        }
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(key.to_string()).or_insert((0, None));
        entry.0 += 1;
        if entry.0 == 1 {
            entry.1 = Some(expire_at);
        }
        Ok(entry.0)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    appended: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.appended.lock().unwrap().clone()
    }

    pub fn decoded_events(&self) -> Vec<UsageEvent> {
        self.events()
            .iter()
            .map(|(_, payload)| serde_json::from_str(payload).unwrap())
            .collect()
    }

    /// Polls until at least `count` events arrived or `timeout` passed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.appended.lock().unwrap().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn append(&self, stream: &str, payload: &str) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::PublishUnavailable("stream offline".to_string()));
        }
        self.appended
            .lock()
            .unwrap()
            .push((stream.to_string(), payload.to_string()));
        Ok(())
    }
}

/// A fully wired gateway over in-memory fakes, with handles on every fake.
pub struct TestGateway {
    pub state: AppState,
    pub directory: Arc<FakeKeyDirectory>,
    pub cache: Arc<FakeKeyCache>,
    pub counters: Arc<FakeCounterStore>,
    pub sink: Arc<RecordingSink>,
}

pub struct TestGatewayOptions {
    pub records: Vec<ApiKeyRecord>,
    pub default_upstream: String,
    pub burst: u32,
    pub default_quota: i64,
    pub policy: PublishPolicy,
    pub admin_token: Option<String>,
}

impl Default for TestGatewayOptions {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            default_upstream: "127.0.0.1:1".to_string(),
            burst: 10,
            default_quota: 10_000,
            policy: PublishPolicy::FireAndForget,
            admin_token: None,
        }
    }
}

impl TestGateway {
    pub fn new(options: TestGatewayOptions) -> Self {
        let directory = Arc::new(FakeKeyDirectory::with_records(options.records));
        let cache = Arc::new(FakeKeyCache::default());
        let counters = Arc::new(FakeCounterStore::default());
        let sink = Arc::new(RecordingSink::default());

        let readiness = Arc::new(ReadinessFlag::new());
        readiness.set_ready();

        let state = AppState {
            resolver: Arc::new(ApiKeyResolver::new(
                directory.clone(),
                cache.clone(),
                Duration::from_secs(60),
            )),
            rate_limiter: Arc::new(RateLimiterRegistry::with_limits(
                0.0,
                options.burst,
                Duration::from_secs(1800),
            )),
            quota_engine: Arc::new(QuotaEngine::new(Some(counters.clone()), options.default_quota)),
            usage_publisher: Arc::new(UsagePublisher::new(sink.clone(), "aether.usage.v1", options.policy)),
            proxy_director: Arc::new(
                ProxyDirector::new(&options.default_upstream, Duration::from_secs(5)).unwrap(),
            ),
            readiness,
            admin_token: options.admin_token,
            max_body_bytes: 1024 * 1024,
        };

        Self {
            state,
            directory,
            cache,
            counters,
            sink,
        }
    }
}
