use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const USAGE_EVENT_VERSION: u32 = 1;

/// One completed request, as published to the usage stream for billing and analytics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: String,
    pub event_version: u32,
    pub request_id: String,
    pub api_key_id: String,
    pub upstream_host: String,
    pub path: String,
    pub method: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub timestamp: String,
}

impl UsageEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: String,
        api_key_id: String,
        upstream_host: String,
        path: String,
        method: String,
        status_code: u16,
        latency_ms: u64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_version: USAGE_EVENT_VERSION,
            request_id,
            api_key_id,
            upstream_host,
            path,
            method,
            status_code,
            latency_ms,
            timestamp: format_timestamp(at),
        }
    }
}

/// RFC 3339, UTC, second precision, `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_wire_format() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(format_timestamp(at), "2025-03-09T14:05:07Z");
    }

    #[test]
    fn test_events_get_fresh_ids() {
        let at = Utc::now();
        let a = UsageEvent::new("r".into(), "1".into(), "h".into(), "/p".into(), "GET".into(), 200, 3, at);
        let b = UsageEvent::new("r".into(), "1".into(), "h".into(), "/p".into(), "GET".into(), 200, 3, at);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.event_version, USAGE_EVENT_VERSION);
    }

    #[test]
    fn test_serialized_field_names() {
        let event = UsageEvent::new(
            "req-1".into(),
            "42".into(),
            "httpbin.org".into(),
            "/proxy/get".into(),
            "GET".into(),
            200,
            12,
            Utc::now(),
        );
        let value = serde_json::to_value(&event).unwrap();
        for field in [
            "event_id",
            "event_version",
            "request_id",
            "api_key_id",
            "upstream_host",
            "path",
            "method",
            "status_code",
            "latency_ms",
            "timestamp",
        ] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }
}
