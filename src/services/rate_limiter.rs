use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::RateLimitConfig;

pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Token bucket state for a single identity.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    fn try_consume(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
        self.last_seen = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-identity token buckets created on first use and evicted after an idle period.
///
/// The map lock is held only long enough to fetch or insert an entry; bucket
/// arithmetic happens under the entry's own mutex, so independent identities
/// never wait on each other.
pub struct RateLimiterRegistry {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    capacity: f64,
    refill_per_sec: f64,
    idle_ttl: Duration,
}

impl RateLimiterRegistry {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_limits(
            config.requests_per_second,
            config.burst,
            Duration::from_secs(config.idle_ttl_secs),
        )
    }

    pub fn with_limits(refill_per_sec: f64, burst: u32, idle_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: f64::from(burst.max(1)),
            refill_per_sec: refill_per_sec.max(0.0),
            idle_ttl,
        }
    }

    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    pub fn allow_at(&self, identity: &str, now: Instant) -> bool {
        let bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::full(self.capacity, now))))
            .value()
            .clone();

        let allowed = match bucket.lock() {
            Ok(mut state) => state.try_consume(self.capacity, self.refill_per_sec, now),
            Err(poisoned) => poisoned
                .into_inner()
                .try_consume(self.capacity, self.refill_per_sec, now),
        };

        if !allowed {
            debug!(identity = %identity, "Token bucket empty");
        }
        allowed
    }

    /// Seconds a rejected caller should wait for one token. Never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        if self.refill_per_sec <= 0.0 {
            return self.idle_ttl.as_secs().max(1);
        }
        ((1.0 / self.refill_per_sec).ceil() as u64).max(1)
    }

    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    /// Removes every bucket not touched within the idle TTL and returns how many went.
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let idle_ttl = self.idle_ttl;
        self.buckets.retain(|_, bucket| {
            let last_seen = match bucket.lock() {
                Ok(state) => state.last_seen,
                Err(poisoned) => poisoned.into_inner().last_seen,
            };
            now.saturating_duration_since(last_seen) < idle_ttl
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.buckets.contains_key(identity)
    }

    /// Runs `evict_idle` every `interval` until the returned handle is aborted.
    /// A zero interval is raised to [`MIN_SWEEP_INTERVAL`].
    pub fn start_sweep_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!(
                interval_secs = interval.as_secs(),
                "Starting rate limiter idle sweep task"
            );
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle();
                if evicted > 0 {
                    debug!(evicted, remaining = registry.len(), "Evicted idle rate limiters");
                }
            }
        })
    }
}
