use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};
use sqlx::error::Error as SqlxError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("X-API-Key header is absent")]
    MissingApiKey,
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("api key disabled")]
    InactiveApiKey,
    #[error("rate limit exceeded (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },
    #[error("monthly quota exceeded")]
    QuotaExceeded,
    #[error("Database error: {0}")]
    Database(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),
    #[error("Usage stream unavailable: {0}")]
    PublishUnavailable(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::MissingApiKey => "missing_api_key",
            AppError::InvalidApiKey => "invalid_api_key",
            AppError::InactiveApiKey => "inactive_api_key",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::QuotaExceeded => "quota_exceeded",
            AppError::Database(_) => "database_error",
            AppError::Cache(_) => "cache_error",
            AppError::Internal(_) => "internal_error",
            AppError::Configuration(_) => "configuration_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::UpstreamUnavailable(_) => "bad_gateway",
            AppError::UpstreamTimeout(_) => "gateway_timeout",
            AppError::PublishUnavailable(_) => "service_unavailable",
            AppError::BadRequest(_) => "bad_request",
            AppError::MethodNotAllowed(_) => "method_not_allowed",
            AppError::Unauthorized(_) => "unauthorized",
        }
    }

    /// Message safe to show to clients. Store and upstream details stay in the log.
    fn public_message(&self) -> String {
        match self {
            AppError::MissingApiKey | AppError::InvalidApiKey | AppError::InactiveApiKey => {
                self.to_string()
            }
            AppError::RateLimited { .. } => "rate limit exceeded".to_string(),
            AppError::QuotaExceeded => "quota exceeded".to_string(),
            AppError::Database(_)
            | AppError::Cache(_)
            | AppError::Internal(_)
            | AppError::Configuration(_)
            | AppError::Serialization(_) => "internal server error".to_string(),
            AppError::UpstreamUnavailable(_) => "upstream unavailable".to_string(),
            AppError::UpstreamTimeout(_) => "upstream timed out".to_string(),
            AppError::PublishUnavailable(_) => "service unavailable".to_string(),
            AppError::BadRequest(msg) => msg.clone(),
            AppError::MethodNotAllowed(_) => "method not allowed".to_string(),
            AppError::Unauthorized(_) => "unauthorized".to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            error: self.error_type().to_string(),
            message: self.public_message(),
        };

        let mut builder = HttpResponse::build(status_code);
        if let AppError::RateLimited { retry_after_secs } = self {
            builder.insert_header(("Retry-After", retry_after_secs.to_string()));
        }
        builder.json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingApiKey => StatusCode::UNAUTHORIZED,
            AppError::InvalidApiKey => StatusCode::FORBIDDEN,
            AppError::InactiveApiKey => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::QuotaExceeded => StatusCode::FORBIDDEN,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::PublishUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        AppError::Database(error.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(error: redis::RedisError) -> Self {
        AppError::Cache(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Serialization(format!("JSON deserialization/serialization error: {}", error))
    }
}

// Define AppResult type alias for Result<T, AppError>
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_internal_detail_is_not_leaked() {
        let err = AppError::Database("password authentication failed for user aegis".to_string());
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("internal server error"));
        assert!(!text.contains("password"));
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let resp = AppError::RateLimited { retry_after_secs: 3 }.error_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "3");
    }

    #[test]
    fn test_auth_statuses() {
        assert_eq!(AppError::MissingApiKey.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::InvalidApiKey.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::InactiveApiKey.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::QuotaExceeded.status_code(), StatusCode::FORBIDDEN);
    }
}
