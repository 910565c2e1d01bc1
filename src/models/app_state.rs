use std::sync::Arc;

use crate::services::{
    ApiKeyResolver, ProxyDirector, QuotaEngine, RateLimiterRegistry, ReadinessFlag, UsagePublisher,
};

/// Everything the request pipeline shares, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<ApiKeyResolver>,
    pub rate_limiter: Arc<RateLimiterRegistry>,
    pub quota_engine: Arc<QuotaEngine>,
    pub usage_publisher: Arc<UsagePublisher>,
    pub proxy_director: Arc<ProxyDirector>,
    pub readiness: Arc<ReadinessFlag>,
    /// When set, cache administration requires a matching `X-Admin-Token`.
    pub admin_token: Option<String>,
    pub max_body_bytes: usize,
}
