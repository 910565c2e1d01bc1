use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::AppError;

/// Shared Redis handle used by the key cache, the quota counter and the usage stream.
///
/// Every command runs under `op_timeout` so a stalled Redis never holds a
/// request longer than that; callers treat the resulting error like any
/// other store failure.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: Arc<ConnectionManager>,
    op_timeout: Duration,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        let connection_manager = tokio::time::timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| AppError::Cache(format!("timed out connecting to Redis at {}", redis_url)))??;

        info!(redis_url = %redis_url, "Redis connection established");

        Ok(Self {
            connection_manager: Arc::new(connection_manager),
            op_timeout,
        })
    }

    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, AppError> {
        let mut conn = self.connection_manager.as_ref().clone();
        match tokio::time::timeout(self.op_timeout, cmd.query_async::<T>(&mut conn)).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(AppError::Cache(format!(
                "Redis operation timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}
