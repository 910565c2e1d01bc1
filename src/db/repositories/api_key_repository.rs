use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;

use crate::error::AppError;
use crate::models::ApiKeyRecord;

/// Durable source of truth for API keys, queried by key hash.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// `Ok(None)` when no key has this hash; `Err` when the directory cannot be reached.
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, AppError>;
}

#[derive(Debug, FromRow)]
struct ApiKeyRow {
    id: i64,
    key: String,
    name: String,
    upstream_host: Option<String>,
    is_active: bool,
    monthly_quota: Option<i32>,
    created_at: DateTime<Utc>,
}

impl From<ApiKeyRow> for ApiKeyRecord {
    fn from(row: ApiKeyRow) -> Self {
        ApiKeyRecord {
            id: row.id,
            key_hash: row.key,
            name: row.name,
            upstream_host: row.upstream_host.unwrap_or_default(),
            active: row.is_active,
            monthly_quota: row.monthly_quota.map(i64::from).unwrap_or(0),
            created_at: row.created_at,
        }
    }
}

pub struct ApiKeyRepository {
    db_pool: PgPool,
    query_timeout: Duration,
}

impl ApiKeyRepository {
    pub fn new(db_pool: PgPool) -> Self {
        Self {
            db_pool,
            query_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl KeyDirectory for ApiKeyRepository {
    /// Inactive keys are returned as well; the caller decides what to do with them.
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, AppError> {
        let query = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            SELECT id, key, name, upstream_host, is_active, monthly_quota, created_at
            FROM api_keys
            WHERE key = $1
            LIMIT 1
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.db_pool);

        let row = tokio::time::timeout(self.query_timeout, query)
            .await
            .map_err(|_| AppError::Database("API key lookup timed out".to_string()))?
            .map_err(|e| {
                log::error!("Database error finding API key: {}", e);
                AppError::Database(format!("Failed to fetch API key: {}", e))
            })?;

        Ok(row.map(ApiKeyRecord::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion_defaults_nullable_columns() {
        let row = ApiKeyRow {
            id: 1,
            key: "f".repeat(64),
            name: "internal-test".to_string(),
            upstream_host: None,
            is_active: false,
            monthly_quota: None,
            created_at: Utc::now(),
        };

        let record = ApiKeyRecord::from(row);
        assert_eq!(record.upstream_host, "");
        assert_eq!(record.monthly_quota, 0);
        assert!(!record.active);
        assert_eq!(record.key_hash.len(), 64);
    }
}
