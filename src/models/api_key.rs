use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An API key as stored in the key directory. Only the hash of the secret is ever kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub key_hash: String,
    pub name: String,
    /// Empty means "use the gateway default upstream".
    #[serde(default)]
    pub upstream_host: String,
    pub active: bool,
    /// Zero or negative means "use the system default".
    pub monthly_quota: i64,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    pub fn upstream_override(&self) -> Option<&str> {
        let host = self.upstream_host.trim();
        if host.is_empty() { None } else { Some(host) }
    }

    pub fn effective_quota(&self, default_quota: i64) -> i64 {
        if self.monthly_quota > 0 {
            self.monthly_quota
        } else {
            default_quota
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(upstream: &str, quota: i64) -> ApiKeyRecord {
        ApiKeyRecord {
            id: 7,
            key_hash: "ab".repeat(32),
            name: "default-dev".to_string(),
            upstream_host: upstream.to_string(),
            active: true,
            monthly_quota: quota,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_effective_quota_falls_back_to_default() {
        assert_eq!(record("", 0).effective_quota(10_000), 10_000);
        assert_eq!(record("", -5).effective_quota(10_000), 10_000);
        assert_eq!(record("", 250).effective_quota(10_000), 250);
    }

    #[test]
    fn test_blank_upstream_is_no_override() {
        assert_eq!(record("  ", 1).upstream_override(), None);
        assert_eq!(record("https://httpbin.org", 1).upstream_override(), Some("https://httpbin.org"));
    }

    #[test]
    fn test_cache_wire_format_round_trips() {
        let original = record("postman-echo.com", 5000);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: ApiKeyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }
}
