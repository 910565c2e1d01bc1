use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PublishPolicy;
use crate::error::AppError;
use crate::models::UsageEvent;
use crate::services::redis_store::RedisStore;

/// Append-only destination for serialized usage events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, stream: &str, payload: &str) -> Result<(), AppError>;
}

/// Appends to a Redis stream as `XADD <stream> * payload <json>`.
pub struct RedisEventSink {
    store: RedisStore,
}

impl RedisEventSink {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSink for RedisEventSink {
    async fn append(&self, stream: &str, payload: &str) -> Result<(), AppError> {
        let entry_id: String = self
            .store
            .query(redis::cmd("XADD").arg(stream).arg("*").arg("payload").arg(payload))
            .await
            .map_err(|e| AppError::PublishUnavailable(e.to_string()))?;
        debug!(stream = %stream, entry_id = %entry_id, "Usage event appended");
        Ok(())
    }
}

/// Used when no Redis address is configured: events go to the log only.
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn append(&self, stream: &str, payload: &str) -> Result<(), AppError> {
        info!(stream = %stream, payload = %payload, "usage_event");
        Ok(())
    }
}

pub struct UsagePublisher {
    sink: Arc<dyn EventSink>,
    stream_name: String,
    policy: PublishPolicy,
}

impl UsagePublisher {
    pub fn new(sink: Arc<dyn EventSink>, stream_name: impl Into<String>, policy: PublishPolicy) -> Self {
        Self {
            sink,
            stream_name: stream_name.into(),
            policy,
        }
    }

    pub fn policy(&self) -> PublishPolicy {
        self.policy
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub async fn publish(&self, event: &UsageEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(event)?;
        self.sink.append(&self.stream_name, &payload).await.map_err(|e| match e {
            AppError::PublishUnavailable(_) => e,
            other => AppError::PublishUnavailable(other.to_string()),
        })
    }

    /// Publishes on a background task. Failures are logged and otherwise ignored.
    pub fn publish_detached(self: &Arc<Self>, event: UsageEvent) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(event_id = %event.event_id, "No runtime available, usage event dropped");
                return;
            }
        };

        let publisher = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = publisher.publish(&event).await {
                warn!(
                    event_id = %event.event_id,
                    request_id = %event.request_id,
                    error = %e,
                    "Failed to publish usage event"
                );
            }
        });
    }
}
