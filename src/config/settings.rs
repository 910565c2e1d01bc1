use std::env;
use crate::error::AppError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSettings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub gateway: GatewayConfig,
    pub rate_limit: RateLimitConfig,
    pub usage: UsageConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ready_delay_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    /// `None` runs the gateway on in-process structures only.
    pub url: Option<String>,
    pub op_timeout_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub default_upstream: String,
    pub upstream_timeout_secs: u64,
    pub key_cache_ttl_secs: u64,
    pub default_monthly_quota: i64,
    pub admin_token: Option<String>,
    pub max_body_bytes: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishPolicy {
    /// Append on a background task; the client response never depends on it.
    FireAndForget,
    /// Await the append and answer 503 when it fails.
    Blocking,
}

impl std::str::FromStr for PublishPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fire-and-forget" | "fire_and_forget" | "async" => Ok(PublishPolicy::FireAndForget),
            "blocking" | "sync" => Ok(PublishPolicy::Blocking),
            other => Err(AppError::Configuration(format!(
                "AEGIS_USAGE_PUBLISH_POLICY must be 'fire-and-forget' or 'blocking', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageConfig {
    pub stream_name: String,
    pub publish_policy: PublishPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst: 10,
            idle_ttl_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_required(key: &str) -> Result<String, AppError> {
    env_opt(key).ok_or_else(|| AppError::Configuration(format!("{} must be set", key)))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, AppError> {
    env_or(key, default)
        .parse::<T>()
        .map_err(|_| AppError::Configuration(format!("{} must be a valid number", key)))
}

fn require_nonzero(key: &str, value: u64) -> Result<u64, AppError> {
    if value == 0 {
        return Err(AppError::Configuration(format!("{} must be at least 1", key)));
    }
    Ok(value)
}

/// Accepts a bare `host:port` as well as a full `redis://` URL.
fn normalize_redis_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{}", addr)
    }
}

impl AppSettings {
    pub fn from_env() -> Result<Self, AppError> {
        // Server config
        let host = env_or("AEGIS_LISTEN_HOST", "0.0.0.0");
        let port = env_required("AEGIS_LISTEN_PORT")?
            .parse::<u16>()
            .map_err(|_| AppError::Configuration("AEGIS_LISTEN_PORT must be a valid port number".to_string()))?;
        let ready_delay_secs = env_parse::<u64>("AEGIS_READY_DELAY_SECS", "2")?;

        // Database config
        let database_url = env_required("AEGIS_DATABASE_URL")?;
        let max_connections = env_parse::<u32>("AEGIS_DATABASE_MAX_CONNECTIONS", "10")?;

        // Redis
        let redis_url = env_opt("AEGIS_REDIS_ADDR").map(|addr| normalize_redis_url(&addr));
        let op_timeout_ms = env_parse::<u64>("AEGIS_REDIS_TIMEOUT_MS", "250")?;

        // Gateway
        let default_upstream = env_or("AEGIS_UPSTREAM_URL", "http://localhost:9000");
        let upstream_timeout_secs = env_parse::<u64>("AEGIS_UPSTREAM_TIMEOUT_SECS", "30")?;
        let key_cache_ttl_secs = env_parse::<u64>("AEGIS_KEY_CACHE_TTL_SECS", "60")?;
        let default_monthly_quota = env_parse::<i64>("AEGIS_DEFAULT_MONTHLY_QUOTA", "10000")?;
        if default_monthly_quota <= 0 {
            return Err(AppError::Configuration(
                "AEGIS_DEFAULT_MONTHLY_QUOTA must be positive".to_string(),
            ));
        }
        let admin_token = env_opt("AEGIS_ADMIN_TOKEN");
        let max_body_bytes = env_parse::<usize>("AEGIS_MAX_BODY_BYTES", "10485760")?;

        // Rate limiting
        let requests_per_second = env_parse::<f64>("AEGIS_RATE_LIMIT_RPS", "5")?;
        if !requests_per_second.is_finite() || requests_per_second < 0.0 {
            return Err(AppError::Configuration(
                "AEGIS_RATE_LIMIT_RPS must be a non-negative number".to_string(),
            ));
        }
        let burst = env_parse::<u32>("AEGIS_RATE_LIMIT_BURST", "10")?;
        if burst == 0 {
            return Err(AppError::Configuration("AEGIS_RATE_LIMIT_BURST must be at least 1".to_string()));
        }
        let idle_ttl_secs = env_parse::<u64>("AEGIS_RATE_LIMIT_IDLE_TTL_SECS", "1800")?;
        let sweep_interval_secs = require_nonzero(
            "AEGIS_RATE_LIMIT_SWEEP_SECS",
            env_parse::<u64>("AEGIS_RATE_LIMIT_SWEEP_SECS", "300")?,
        )?;

        // Usage stream
        let stream_name = env_or("AEGIS_USAGE_STREAM", "aether.usage.v1");
        let publish_policy = env_or("AEGIS_USAGE_PUBLISH_POLICY", "fire-and-forget").parse::<PublishPolicy>()?;

        Ok(Self {
            server: ServerConfig {
                host,
                port,
                ready_delay_secs,
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections,
            },
            redis: RedisConfig {
                url: redis_url,
                op_timeout_ms,
            },
            gateway: GatewayConfig {
                default_upstream,
                upstream_timeout_secs,
                key_cache_ttl_secs,
                default_monthly_quota,
                admin_token,
                max_body_bytes,
            },
            rate_limit: RateLimitConfig {
                requests_per_second,
                burst,
                idle_ttl_secs,
                sweep_interval_secs,
            },
            usage: UsageConfig {
                stream_name,
                publish_policy,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_policy_parsing() {
        assert_eq!("fire-and-forget".parse::<PublishPolicy>().unwrap(), PublishPolicy::FireAndForget);
        assert_eq!("Blocking".parse::<PublishPolicy>().unwrap(), PublishPolicy::Blocking);
        assert!("sometimes".parse::<PublishPolicy>().is_err());
    }

    #[test]
    fn test_normalize_redis_url() {
        assert_eq!(normalize_redis_url("localhost:6379"), "redis://localhost:6379");
        assert_eq!(normalize_redis_url("rediss://cache:6380"), "rediss://cache:6380");
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let err = require_nonzero("AEGIS_RATE_LIMIT_SWEEP_SECS", 0).unwrap_err();
        assert!(matches!(err, AppError::Configuration(ref msg) if msg.contains("AEGIS_RATE_LIMIT_SWEEP_SECS")));
        assert_eq!(require_nonzero("AEGIS_RATE_LIMIT_SWEEP_SECS", 300).unwrap(), 300);
    }
}
