use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use crate::config::settings::DatabaseConfig;
use crate::error::AppError;

/// Creates the PostgreSQL pool backing the key directory.
///
/// Retries a few times before failing so the gateway can start alongside a
/// database that is still booting.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, AppError> {
    log::info!("Creating database connection pool");

    let max_retries = 3;
    let mut last_error = None;

    for attempt in 1..=max_retries {
        log::info!("Database connection attempt {} of {}", attempt, max_retries);

        match PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(60))
            .connect(&config.url)
            .await
        {
            Ok(pool) => {
                log::info!("Successfully connected to database");
                return Ok(pool);
            }
            Err(e) => {
                log::warn!("Database connection attempt {} failed: {}", attempt, e);

                if e.to_string().contains("authentication failed") {
                    log::error!("Database authentication failed. Please check AEGIS_DATABASE_URL credentials.");
                    return Err(AppError::from(e));
                }

                if e.to_string().contains("Connection refused") {
                    log::error!("Database connection refused. Please check if the database server is running and accessible.");
                }

                last_error = Some(e);

                if attempt < max_retries {
                    let delay = Duration::from_secs(2 * attempt as u64);
                    log::info!("Retrying in {} seconds...", delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let error = last_error
        .unwrap_or_else(|| sqlx::Error::Configuration("Unknown database connection error".into()));

    log::error!("All database connection attempts failed: {}", error);
    Err(AppError::from(error))
}

/// Verifies the database connection by executing a simple query.
pub async fn verify_connection(pool: &PgPool) -> Result<(), AppError> {
    sqlx::query_as::<_, (i32,)>("SELECT 1 as result")
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            log::error!("Database connection verification failed: {}", e);
            AppError::from(e)
        })?;

    log::info!("Database connection verified successfully");
    Ok(())
}
