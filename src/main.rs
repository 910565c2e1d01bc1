use actix_web::HttpServer;
use anyhow::Context;
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aegis_gateway::config::{init_config, AppSettings};
use aegis_gateway::db::{create_pool, verify_connection, ApiKeyRepository};
use aegis_gateway::routes::build_app;
use aegis_gateway::services::{
    ApiKeyResolver, EventSink, InMemoryKeyCache, KeyCache, LogEventSink, ProxyDirector, QuotaCounterStore,
    QuotaEngine, RateLimiterRegistry, ReadinessFlag, RedisEventSink, RedisKeyCache, RedisQuotaCounter, RedisStore,
    UsagePublisher,
};
use aegis_gateway::AppState;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // `init` also installs the `log` bridge, so middleware using `log` macros
    // lands in the same output.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn connect_redis(settings: &AppSettings) -> Option<RedisStore> {
    let url = settings.redis.url.as_deref()?;
    let op_timeout = Duration::from_millis(settings.redis.op_timeout_ms);

    match RedisStore::connect(url, op_timeout).await {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "Redis unavailable, running on in-process cache, quota and usage log");
            None
        }
    }
}

async fn build_state(settings: &AppSettings) -> anyhow::Result<AppState> {
    let pool = create_pool(&settings.database)
        .await
        .context("cannot start without the key directory database")?;
    verify_connection(&pool).await?;
    let directory = Arc::new(ApiKeyRepository::new(pool));

    let redis = connect_redis(settings).await;
    let (cache, counter, sink) = match redis {
        Some(store) => {
            let cache: Arc<dyn KeyCache> = Arc::new(RedisKeyCache::new(store.clone()));
            let counter: Arc<dyn QuotaCounterStore> = Arc::new(RedisQuotaCounter::new(store.clone()));
            let sink: Arc<dyn EventSink> = Arc::new(RedisEventSink::new(store));
            (cache, Some(counter), sink)
        }
        None => {
            let cache: Arc<dyn KeyCache> = Arc::new(InMemoryKeyCache::new());
            let sink: Arc<dyn EventSink> = Arc::new(LogEventSink);
            (cache, None, sink)
        }
    };

    let gateway = &settings.gateway;
    let proxy_director = ProxyDirector::new(
        &gateway.default_upstream,
        Duration::from_secs(gateway.upstream_timeout_secs),
    )?;

    Ok(AppState {
        resolver: Arc::new(ApiKeyResolver::new(
            directory,
            cache,
            Duration::from_secs(gateway.key_cache_ttl_secs),
        )),
        rate_limiter: Arc::new(RateLimiterRegistry::new(&settings.rate_limit)),
        quota_engine: Arc::new(QuotaEngine::new(counter, gateway.default_monthly_quota)),
        usage_publisher: Arc::new(UsagePublisher::new(
            sink,
            settings.usage.stream_name.clone(),
            settings.usage.publish_policy,
        )),
        proxy_director: Arc::new(proxy_director),
        readiness: Arc::new(ReadinessFlag::new()),
        admin_token: gateway.admin_token.clone(),
        max_body_bytes: gateway.max_body_bytes,
    })
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_logging();

    let settings = match init_config() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Failed to load gateway settings");
            return Err(e.into());
        }
    };

    let state = build_state(&settings).await?;

    let _sweeper = state
        .rate_limiter
        .start_sweep_task(Duration::from_secs(settings.rate_limit.sweep_interval_secs));

    let readiness = state.readiness.clone();
    let ready_delay = Duration::from_secs(settings.server.ready_delay_secs);
    actix_rt::spawn(async move {
        tokio::time::sleep(ready_delay).await;
        readiness.set_ready();
        info!("Gateway marked ready");
    });

    let host = settings.server.host.clone();
    let port = settings.server.port;
    info!(
        host = %host,
        port,
        upstream = %state.proxy_director.default_upstream(),
        usage_stream = %state.usage_publisher.stream_name(),
        "Starting aegis gateway"
    );

    HttpServer::new(move || build_app(state.clone()))
        .bind((host.as_str(), port))
        .with_context(|| format!("failed to bind {}:{}", host, port))?
        .run()
        .await?;

    info!("Gateway stopped");
    Ok(())
}
