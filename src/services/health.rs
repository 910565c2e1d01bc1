use std::sync::atomic::{AtomicBool, Ordering};

/// Readiness as reported by `/healthz`. Starts not-ready.
#[derive(Debug, Default)]
pub struct ReadinessFlag {
    ready: AtomicBool,
}

impl ReadinessFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
