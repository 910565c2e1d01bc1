pub mod api_key_resolver;
pub mod health;
pub mod key_cache;
pub mod proxy_director;
pub mod quota;
pub mod rate_limiter;
pub mod redis_store;
pub mod usage_publisher;

pub use api_key_resolver::ApiKeyResolver;
pub use health::ReadinessFlag;
pub use key_cache::{InMemoryKeyCache, KeyCache, RedisKeyCache};
pub use proxy_director::ProxyDirector;
pub use quota::{QuotaCounterStore, QuotaEngine, RedisQuotaCounter};
pub use rate_limiter::RateLimiterRegistry;
pub use redis_store::RedisStore;
pub use usage_publisher::{EventSink, LogEventSink, RedisEventSink, UsagePublisher};
