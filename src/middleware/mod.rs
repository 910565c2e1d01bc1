pub mod access_log;
pub mod api_key_auth;
pub mod buffering;
pub mod correlation_id;
pub mod quota;
pub mod rate_limiting;
pub mod recovery;
pub mod usage;

pub use access_log::AccessLog;
pub use api_key_auth::ApiKeyAuthentication;
pub use buffering::ResponseBuffer;
pub use correlation_id::CorrelationId;
pub use quota::QuotaEnforcement;
pub use rate_limiting::RateLimitMiddleware;
pub use recovery::FaultRecovery;
pub use usage::UsageRecorder;
